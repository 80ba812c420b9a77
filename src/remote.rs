//! Client-side boundary to the remote-procedure-call layer.
//!
//! The RPC transport itself lives outside this crate; what the core needs
//! is (1) a uniform client handle for talking to another device process and
//! (2) a machine-readable description of which operations are remotely
//! callable, with what permission level, and whether they block the caller.
//!
//! The description is an explicit table rather than call-site annotations,
//! so the same metadata serves a local in-process caller and a network
//! transport identically.

use crate::error::DaqResult;
use crate::metadata::MetaMap;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

/// Handle to one remote device process.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Name of the device class this client talks to.
    fn name(&self) -> &str;

    /// Cheap liveness probe; an error means the connection is dead and the
    /// handle must be discarded.
    async fn ping(&self) -> DaqResult<()>;

    /// Fetch the device's current metadata map.
    async fn get_meta(&self) -> DaqResult<MetaMap>;

    /// Request (or force) elevated permission on the remote end.
    async fn ask_admin(&self, force: bool) -> DaqResult<()>;

    /// Ask the remote process to terminate. Requires admin.
    async fn kill(&self) -> DaqResult<()>;
}

/// Factory used by the registry reconciliation loop to probe and open
/// client connections by device-class name.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(&self, name: &str) -> DaqResult<Arc<dyn RemoteClient>>;
}

/// Metadata describing one remotely callable operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationInfo {
    pub name: &'static str,
    /// Requires elevated permission.
    pub admin: bool,
    /// Blocks the caller until complete (as opposed to returning a handle
    /// to an in-flight operation).
    pub blocking: bool,
}

/// Remotely callable operations of the acquisition engine.
pub const CAMERA_OPERATIONS: &[OperationInfo] = &[
    OperationInfo { name: "snap", admin: true, blocking: false },
    OperationInfo { name: "arm", admin: true, blocking: true },
    OperationInfo { name: "disarm", admin: true, blocking: true },
    OperationInfo { name: "roll", admin: true, blocking: false },
    OperationInfo { name: "live_on", admin: true, blocking: true },
    OperationInfo { name: "live_off", admin: true, blocking: true },
    OperationInfo { name: "reset_counter", admin: true, blocking: true },
    OperationInfo { name: "settings_json", admin: false, blocking: true },
    OperationInfo { name: "get_meta", admin: false, blocking: true },
];

/// Remotely callable operations of the experiment manager.
pub const MANAGER_OPERATIONS: &[OperationInfo] = &[
    OperationInfo { name: "start_scan", admin: false, blocking: true },
    OperationInfo { name: "end_scan", admin: false, blocking: true },
    OperationInfo { name: "next_scan", admin: false, blocking: true },
    OperationInfo { name: "next_prefix", admin: false, blocking: true },
    OperationInfo { name: "get_counter", admin: false, blocking: true },
    OperationInfo { name: "request_meta", admin: false, blocking: true },
    OperationInfo { name: "return_meta", admin: false, blocking: true },
    OperationInfo { name: "status", admin: false, blocking: true },
    OperationInfo { name: "get_meta", admin: false, blocking: true },
    OperationInfo { name: "killall", admin: true, blocking: true },
];

/// Registry of operation tables keyed by device-class name.
pub static OPERATIONS: Lazy<HashMap<&'static str, &'static [OperationInfo]>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("camera", CAMERA_OPERATIONS);
    map.insert("manager", MANAGER_OPERATIONS);
    map
});

/// Look up the descriptor for one operation of one device class.
pub fn operation(class: &str, name: &str) -> Option<&'static OperationInfo> {
    OPERATIONS
        .get(class)
        .and_then(|ops| ops.iter().find(|op| op.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let snap = operation("camera", "snap").unwrap();
        assert!(snap.admin);
        assert!(!snap.blocking);
        assert!(operation("camera", "no_such_op").is_none());
        assert!(operation("no_such_class", "snap").is_none());
    }

    #[test]
    fn test_killall_requires_admin() {
        let killall = operation("manager", "killall").unwrap();
        assert!(killall.admin);
    }

    #[test]
    fn test_no_duplicate_names_per_class() {
        for ops in OPERATIONS.values() {
            let mut names: Vec<_> = ops.iter().map(|op| op.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), ops.len());
        }
    }
}
