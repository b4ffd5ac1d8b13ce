//! Linux sysfs GPIO driver (`/sys/class/gpio`).

use crate::device::handle::{DeviceError, PinDriver};
use crate::device::types::PinNo;
use crate::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

/// Drives pins through the kernel's sysfs GPIO interface
#[derive(Debug, Clone)]
pub struct SysfsDriver {
    root: PathBuf,
}

impl SysfsDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_dir(&self, pin: PinNo) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn write_file(&self, pin: PinNo, path: &Path, content: &str) -> Result<(), DeviceError> {
        fs::write(path, content).map_err(|source| DeviceError::Io { pin, source })
    }
}

impl Default for SysfsDriver {
    fn default() -> Self {
        Self::new(env::DEFAULT_SYSFS_GPIO_ROOT)
    }
}

impl PinDriver for SysfsDriver {
    fn export(&self, pin: PinNo) -> Result<(), DeviceError> {
        let dir = self.pin_dir(pin);
        if !dir.exists() {
            self.write_file(pin, &self.root.join("export"), &pin.to_string())?;
        }

        // udev may need a moment to fix permissions on a freshly exported line
        let direction = dir.join("direction");
        off_runtime(|| {
            for _ in 0..env::SYSFS_EXPORT_RETRIES {
                if direction.exists() {
                    break;
                }
                thread::sleep(Duration::from_millis(env::SYSFS_EXPORT_WAIT_MS));
            }
        });

        self.write_file(pin, &direction, "out")?;
        debug!(pin, "Exported pin as output");
        Ok(())
    }

    fn write(&self, pin: PinNo, level: bool) -> Result<(), DeviceError> {
        let value = self.pin_dir(pin).join("value");
        if !value.exists() {
            return Err(DeviceError::NotExported { pin });
        }
        self.write_file(pin, &value, if level { "1" } else { "0" })
    }

    fn read(&self, pin: PinNo) -> Result<bool, DeviceError> {
        let value = self.pin_dir(pin).join("value");
        let raw = fs::read_to_string(&value).map_err(|source| DeviceError::Io { pin, source })?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(DeviceError::InvalidValue {
                pin,
                value: other.to_string(),
            }),
        }
    }

    fn unexport(&self, pin: PinNo) -> Result<(), DeviceError> {
        if !self.pin_dir(pin).exists() {
            return Ok(());
        }
        self.write_file(pin, &self.root.join("unexport"), &pin.to_string())
    }
}

/// Run blocking `f` without starving other tasks. On a multi-threaded runtime
/// the worker hands its queue to another thread first; a current-thread
/// runtime has nowhere to hand it, so `f` runs in place.
fn off_runtime<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(pin: PinNo) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(format!("gpio{}", pin));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in").unwrap();
        fs::write(dir.join("value"), "0").unwrap();
        root
    }

    #[test]
    fn test_write_and_read_value_file() {
        let root = fake_sysfs(17);
        let driver = SysfsDriver::new(root.path());

        driver.export(17).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio17/direction")).unwrap(),
            "out"
        );

        driver.write(17, true).unwrap();
        assert!(driver.read(17).unwrap());
        driver.write(17, false).unwrap();
        assert!(!driver.read(17).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_export_waits_without_blocking_the_runtime() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("export"), "").unwrap();
        let dir = root.path().join("gpio22");
        fs::create_dir_all(&dir).unwrap();

        // Stand-in for udev, creating the line's files a little later
        let udev = tokio::spawn({
            let dir = dir.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                fs::write(dir.join("direction"), "in").unwrap();
            }
        });

        let driver = SysfsDriver::new(root.path());
        tokio::spawn(async move { driver.export(22) })
            .await
            .unwrap()
            .unwrap();
        udev.await.unwrap();

        assert_eq!(fs::read_to_string(dir.join("direction")).unwrap(), "out");
    }

    #[test]
    fn test_write_to_unexported_pin_fails() {
        let root = tempfile::tempdir().unwrap();
        let driver = SysfsDriver::new(root.path());

        assert!(matches!(
            driver.write(4, true),
            Err(DeviceError::NotExported { pin: 4 })
        ));
    }

    #[test]
    fn test_garbage_value_is_reported() {
        let root = fake_sysfs(5);
        fs::write(root.path().join("gpio5/value"), "x\n").unwrap();
        let driver = SysfsDriver::new(root.path());

        assert!(matches!(
            driver.read(5),
            Err(DeviceError::InvalidValue { pin: 5, .. })
        ));
    }
}
