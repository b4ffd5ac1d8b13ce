use crate::device::types::PinNo;

// Header pin map shared by Model A+, B+, Zero, Zero W, 2B, 3B and 4B:
//
//        GPIO pin pin GPIO
//  3V3     -   1   2   -   5V
//  SDA     2   3   4   -   5V
//  SCL     3   5   6   -   GND
//          4   7   8  14   TXD
//  GND     -   9  10  15   RXD
//  CE1    17  11  12  18   CE0
//         27  13  14   -   GND
//         22  15  16  23
//  3V3     -  17  18  24
//  MOSI   10  19  20   -   GND
//  MISO    9  21  22  25
//  SCLK   11  23  24   8   CE0
//  GND     -  25  26   7   CE1
//  ID_SD   0  27  28   1   ID_SC
//          5  29  30   -   GND
//          6  31  32  12
//         13  33  34   -   GND
//  MISO   19  35  36  16   CE2
//         26  37  38  20   MOSI
//  GND     -  39  40  21   SCLK

/// Pins with no alternate function on the supported boards
pub const COMMON_PINS: [PinNo; 12] = [4, 17, 27, 22, 5, 6, 13, 26, 23, 24, 25, 12];

pub fn is_common_pin(pin: PinNo) -> bool {
    COMMON_PINS.contains(&pin)
}

/// Pins from `pins` that may not be used for actuators, in input order
pub fn reserved_pins(pins: impl IntoIterator<Item = PinNo>) -> Vec<PinNo> {
    pins.into_iter().filter(|pin| !is_common_pin(*pin)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_pins() {
        assert!(is_common_pin(17));
        assert!(is_common_pin(5));
        assert!(!is_common_pin(2));
        assert!(!is_common_pin(14));
        assert_eq!(reserved_pins([17, 2, 5, 10]), vec![2, 10]);
    }
}
