//! Pump/valve interlock.
//!
//! The pump must never run with every valve closed, and no valve may be opened
//! while the pump is off. The "last open valve" check always scans the whole
//! rig, not just the task being changed: closing one task's valves must not
//! starve valves that another task keeps open.
//!
//! Decision functions ([`pump_needs_start`], [`plan_close`]) only look at
//! device states. Commanding functions write, read back, and report.

use crate::device::{DeviceId, DeviceReport, DeviceSet, PinState};
use crate::task::outcome::RigError;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What closing a set of valves requires from the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpPlan {
    /// Other valves stay open, or the pump is not running
    Leave,
    /// The valves being closed are the last open ones: stop the pump and drain first
    Stop,
}

/// Whether the pump has to be commanded on before any valve may open
pub fn pump_needs_start(devices: &DeviceSet) -> Result<bool, RigError> {
    let pump = devices.pump().ok_or(RigError::NoPumpConfigured)?;
    Ok(pump.state() != PinState::High)
}

/// Decide the pump action for closing `closing`
pub fn plan_close(devices: &DeviceSet, closing: &[DeviceId]) -> PumpPlan {
    let Some(pump) = devices.pump() else {
        return PumpPlan::Leave;
    };
    if pump.state() == PinState::High && devices.open_valves_outside(closing) == 0 {
        PumpPlan::Stop
    } else {
        PumpPlan::Leave
    }
}

/// Turn the pump on if it is not already, and confirm by read-back
pub fn ensure_pump_on(devices: &mut DeviceSet) -> Result<(), RigError> {
    if !pump_needs_start(devices)? {
        return Ok(());
    }

    let pump = devices.pump_mut().ok_or(RigError::NoPumpConfigured)?;
    let report = pump.command(PinState::High);
    if !report.is_ok() {
        error!(pin = report.pin_no, state = %report.actual, "Could not start the Pump");
        return Err(RigError::Actuation(vec![report]));
    }

    info!(pin = report.pin_no, "The Pump is turned on");
    Ok(())
}

/// Run the pump side of closing `closing`: when they are the last open valves,
/// stop the pump, wait `drain`, and confirm the pump is off.
pub async fn before_close_valves(
    devices: &mut DeviceSet,
    closing: &[DeviceId],
    drain: Duration,
) -> Result<PumpPlan, RigError> {
    let plan = plan_close(devices, closing);
    if plan == PumpPlan::Leave {
        debug!(
            open_elsewhere = devices.open_valves_outside(closing),
            "Leaving the Pump untouched"
        );
        return Ok(plan);
    }

    let pump = devices.pump_mut().ok_or(RigError::NoPumpConfigured)?;
    pump.command(PinState::Low);
    info!(delay_ms = drain.as_millis() as u64, "Pump stopped, draining before closing valves");
    tokio::time::sleep(drain).await;

    let pump = devices.pump().ok_or(RigError::NoPumpConfigured)?;
    let state = pump.state();
    if state == PinState::High {
        error!(pin = pump.pin_no, "Closing the last valve, but the Pump could not be turned off");
        return Err(RigError::Actuation(vec![DeviceReport {
            id: pump.id,
            name: pump.name.clone(),
            pin_no: pump.pin_no,
            requested: PinState::Low,
            actual: state,
        }]));
    }

    Ok(plan)
}

/// Open `valves`, starting the pump first. Per-device read-back mismatches are
/// reported, not raised; a pump failure aborts before any valve is touched.
/// An empty list leaves the pump alone.
pub fn open_valves(devices: &mut DeviceSet, valves: &[DeviceId]) -> Result<Vec<DeviceReport>, RigError> {
    if valves.is_empty() {
        debug!("No valves to open, leaving the Pump untouched");
        return Ok(Vec::new());
    }
    ensure_pump_on(devices)?;
    Ok(command_all(devices, valves, PinState::High))
}

/// Close `valves`, stopping and draining the pump first if nothing else stays open
pub async fn close_valves(
    devices: &mut DeviceSet,
    valves: &[DeviceId],
    drain: Duration,
) -> Result<Vec<DeviceReport>, RigError> {
    before_close_valves(devices, valves, drain).await?;
    Ok(command_all(devices, valves, PinState::Low))
}

/// Stop the pump, drain if anything was open, then close every valve in the rig.
/// The pump's own report comes first.
pub async fn stop_pump_and_close_all(
    devices: &mut DeviceSet,
    drain: Duration,
) -> Result<Vec<DeviceReport>, RigError> {
    let pump = devices.pump_mut().ok_or(RigError::NoPumpConfigured)?;
    let pump_report = pump.command(PinState::Low);
    if !pump_report.is_ok() {
        error!(pin = pump_report.pin_no, state = %pump_report.actual, "Turn off the Pump fault");
        return Err(RigError::Actuation(vec![pump_report]));
    }

    if devices.any_valve_open() {
        debug!(delay_ms = drain.as_millis() as u64, "Draining before closing valves");
        tokio::time::sleep(drain).await;
    }

    let valves = devices.valve_ids();
    let mut reports = vec![pump_report];
    reports.extend(command_all(devices, &valves, PinState::Low));
    Ok(reports)
}

/// Close every valve without touching the pump. Only valid when there is no pump.
pub fn close_all_without_pump(devices: &mut DeviceSet) -> Vec<DeviceReport> {
    let valves = devices.valve_ids();
    command_all(devices, &valves, PinState::Low)
}

fn command_all(devices: &mut DeviceSet, ids: &[DeviceId], state: PinState) -> Vec<DeviceReport> {
    let mut reports = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(device) = devices.get_mut(*id) else {
            warn!(device = id, "Skipping unknown device");
            continue;
        };
        let report = device.command(state);
        if report.is_ok() {
            debug!(device = %report.name, state = %report.actual, "Device state confirmed");
        } else {
            error!(device = %report.name, pin = report.pin_no, "Error changing device state: {}", report);
        }
        reports.push(report);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind, DeviceRecord, HandleFactory, SimulatedBoard};
    use std::sync::Arc;

    fn rig(board: &Arc<SimulatedBoard>) -> DeviceSet {
        let factory = HandleFactory::simulated(board.clone());
        let mut devices = DeviceSet::new();
        for (id, name, pin, kind) in [
            (1, "Pump", 5, DeviceKind::Pump),
            (2, "V1", 17, DeviceKind::Valve),
            (3, "V2", 27, DeviceKind::Valve),
        ] {
            let record = DeviceRecord {
                id,
                name: name.to_string(),
                pin_no: pin,
                kind,
            };
            devices.insert(Device::new(record, factory.create(pin)));
        }
        devices
    }

    #[test]
    fn test_pump_is_required_to_open() {
        let mut devices = DeviceSet::new();
        assert!(matches!(
            open_valves(&mut devices, &[1]),
            Err(RigError::NoPumpConfigured)
        ));
    }

    #[test]
    fn test_open_starts_pump_before_valve() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);

        let reports = open_valves(&mut devices, &[2]).unwrap();
        assert!(reports.iter().all(DeviceReport::is_ok));

        let writes: Vec<(u8, PinState)> = board.journal().iter().map(|w| (w.pin, w.state)).collect();
        assert_eq!(writes, vec![(5, PinState::High), (17, PinState::High)]);
    }

    #[test]
    fn test_opening_no_valves_leaves_pump_off() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);

        let reports = open_valves(&mut devices, &[]).unwrap();
        assert!(reports.is_empty());
        assert!(board.journal().is_empty());
        assert!(!board.is_claimed(5));
        assert_ne!(devices.pump().unwrap().state(), PinState::High);
    }

    #[test]
    fn test_stuck_pump_aborts_opening() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);
        board.stick(5, PinState::Low);

        let err = open_valves(&mut devices, &[2]).unwrap_err();
        assert_eq!(err.faults().len(), 1);
        assert!(board.journal().iter().all(|w| w.pin != 17));
    }

    #[test]
    fn test_plan_close_scans_whole_rig() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);
        open_valves(&mut devices, &[2, 3]).unwrap();

        assert_eq!(plan_close(&devices, &[2]), PumpPlan::Leave);
        assert_eq!(plan_close(&devices, &[2, 3]), PumpPlan::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_last_valve_drains_pump_first() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);
        open_valves(&mut devices, &[2]).unwrap();
        board.clear_journal();

        let started = tokio::time::Instant::now();
        let reports = close_valves(&mut devices, &[2], Duration::from_millis(3000))
            .await
            .unwrap();
        assert!(reports.iter().all(DeviceReport::is_ok));

        let journal = board.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!((journal[0].pin, journal[0].state), (5, PinState::Low));
        assert_eq!((journal[1].pin, journal[1].state), (17, PinState::Low));
        assert!(journal[1].at - started >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_with_other_valve_open_keeps_pump() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);
        open_valves(&mut devices, &[2, 3]).unwrap();
        board.clear_journal();

        close_valves(&mut devices, &[2], Duration::from_millis(3000))
            .await
            .unwrap();

        assert!(board.journal().iter().all(|w| w.pin != 5));
        assert_eq!(devices.pump().unwrap().state(), PinState::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_stuck_on_is_a_fault_when_closing() {
        let board = Arc::new(SimulatedBoard::new());
        let mut devices = rig(&board);
        open_valves(&mut devices, &[2]).unwrap();
        board.stick(5, PinState::High);

        let err = close_valves(&mut devices, &[2], Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Actuation(_)));
        assert_eq!(devices.get(2).unwrap().state(), PinState::High);
    }
}
