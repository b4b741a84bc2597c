//! Privileged access checks for raw network endpoints
//!
//! Binding a TAP device from an unprivileged emulator silently produces a
//! dead link, so TAP endpoint construction is gated up front: either the
//! controlling process runs as root, or the device binary carries the
//! CAP_NET_RAW file capability.

use std::io;
use std::path::Path;

use tracing::warn;

use super::DeviceError;

/// Bit position of CAP_NET_RAW in the capability set
const CAP_NET_RAW: u32 = 13;

/// Abstraction over the OS facilities the privilege check needs
///
/// A trait seam so tests can exercise both outcomes without root or
/// xattr-capable filesystems.
pub trait CapabilityProbe: Send + Sync {
    /// True if the controlling process runs with elevated privileges
    fn is_elevated(&self) -> bool;

    /// True if `binary` carries the CAP_NET_RAW file capability
    fn has_raw_net_capability(&self, binary: &Path) -> io::Result<bool>;
}

/// Probe backed by the real OS (euid + security.capability xattr)
#[derive(Debug, Default)]
pub struct OsCapabilityProbe;

impl CapabilityProbe for OsCapabilityProbe {
    #[cfg(unix)]
    fn is_elevated(&self) -> bool {
        // geteuid never fails
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    fn is_elevated(&self) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    fn has_raw_net_capability(&self, binary: &Path) -> io::Result<bool> {
        let caps = read_xattr(binary, "security.capability")?;
        // VFS_CAP layout: the permitted set's low word is the second
        // little-endian u32 of the blob
        if caps.len() < 8 {
            return Ok(false);
        }
        let permitted = u32::from_le_bytes([caps[4], caps[5], caps[6], caps[7]]);
        Ok(permitted & (1 << CAP_NET_RAW) != 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn has_raw_net_capability(&self, _binary: &Path) -> io::Result<bool> {
        Ok(false)
    }
}

#[cfg(target_os = "linux")]
fn read_xattr(path: &Path, name: &str) -> io::Result<Vec<u8>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let c_name = CString::new(name).expect("static xattr name");

    let mut buf = vec![0u8; 64];
    let len = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(len as usize);
    Ok(buf)
}

/// Check whether `binary` may open raw/TAP network devices
///
/// Passes unconditionally for an elevated process; otherwise requires the
/// CAP_NET_RAW capability bit on the binary. An unreadable capability set
/// is treated as missing.
pub fn check_privileged_access(
    probe: &dyn CapabilityProbe,
    binary: &Path,
    device: &str,
) -> Result<(), DeviceError> {
    if probe.is_elevated() {
        return Ok(());
    }

    match probe.has_raw_net_capability(binary) {
        Ok(true) => Ok(()),
        Ok(false) => Err(DeviceError::PermissionDenied {
            binary: binary.display().to_string(),
            device: device.to_string(),
        }),
        Err(e) => {
            warn!(
                "could not determine if CAP_NET_RAW is set for {}: {}",
                binary.display(),
                e
            );
            Err(DeviceError::PermissionDenied {
                binary: binary.display().to_string(),
                device: device.to_string(),
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;

    /// Fixed-answer probe for tests
    pub struct StubProbe {
        pub elevated: bool,
        pub capability: io::Result<bool>,
    }

    impl StubProbe {
        pub fn unprivileged(capability: bool) -> Self {
            Self {
                elevated: false,
                capability: Ok(capability),
            }
        }
    }

    impl CapabilityProbe for StubProbe {
        fn is_elevated(&self) -> bool {
            self.elevated
        }

        fn has_raw_net_capability(&self, _binary: &Path) -> io::Result<bool> {
            match &self.capability {
                Ok(v) => Ok(*v),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubProbe;
    use super::*;
    use std::path::PathBuf;

    fn binary() -> PathBuf {
        PathBuf::from("/usr/bin/vpcs")
    }

    #[test]
    fn test_elevated_process_passes() {
        let probe = StubProbe {
            elevated: true,
            capability: Ok(false),
        };
        assert!(check_privileged_access(&probe, &binary(), "tap0").is_ok());
    }

    #[test]
    fn test_capability_bit_passes() {
        let probe = StubProbe::unprivileged(true);
        assert!(check_privileged_access(&probe, &binary(), "tap0").is_ok());
    }

    #[test]
    fn test_missing_capability_is_denied() {
        let probe = StubProbe::unprivileged(false);
        let err = check_privileged_access(&probe, &binary(), "tap0").unwrap_err();
        assert!(matches!(err, DeviceError::PermissionDenied { .. }));
    }

    #[test]
    fn test_unreadable_capability_is_denied() {
        let probe = StubProbe {
            elevated: false,
            capability: Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
        };
        let err = check_privileged_access(&probe, &binary(), "tap0").unwrap_err();
        assert!(matches!(err, DeviceError::PermissionDenied { .. }));
    }
}
