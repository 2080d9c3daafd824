//! Per-tapdisk lifecycle operations.
//!
//! A [`Tapdisk`] is a plain value: the pid and minor that identify the
//! process plus what it currently serves. [`TapdiskManager`] turns lifecycle
//! requests into `tap-ctl` invocations and updates the value on success.

use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::ControlTool;
use crate::error::TapdiskError;
use crate::image::{canonical_path, ImageDescriptor};
use crate::list::{parse_list, ListedTapdisk};
use crate::mirror::{MirrorChannel, UnixFdChannel};

/// Block device path prefix; the minor is appended.
pub const BLKTAP2_PREFIX: &str = "/dev/xen/blktap-2/tapdev";

/// Socket prefix for handing a mirror destination to a tapdisk; the pid is appended.
pub const NBDCLIENT_PREFIX: &str = "/var/run/blktap-control/nbdclient";

/// Socket prefix for handing an incoming NBD connection to a tapdisk.
pub const NBDSERVER_PREFIX: &str = "/var/run/blktap-control/nbdserver";

/// A tapdisk process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tapdisk {
    /// Process id, assigned by `tap-ctl spawn`.
    pub pid: u32,
    /// Device minor, assigned by `tap-ctl allocate`.
    pub minor: Option<u32>,
    /// Image currently open, if any.
    pub image: Option<ImageDescriptor>,
    /// Mirror destination (`nbd:<token>`) applied on unpause.
    pub secondary: Option<String>,
}

impl Tapdisk {
    pub fn new(pid: u32, minor: Option<u32>) -> Self {
        Self {
            pid,
            minor,
            image: None,
            secondary: None,
        }
    }

    /// The `-m <minor> -p <pid>` pair every per-tapdisk command takes.
    fn ids(&self) -> Result<(String, String), TapdiskError> {
        let minor = self
            .minor
            .ok_or(TapdiskError::Unallocated { pid: self.pid })?;
        Ok((minor.to_string(), self.pid.to_string()))
    }
}

/// Filesystem conventions shared with blktap.
#[derive(Debug, Clone)]
pub struct TapdiskPaths {
    pub device_prefix: String,
    pub nbdclient_prefix: String,
    pub nbdserver_prefix: String,
}

impl Default for TapdiskPaths {
    fn default() -> Self {
        Self {
            device_prefix: BLKTAP2_PREFIX.to_string(),
            nbdclient_prefix: NBDCLIENT_PREFIX.to_string(),
            nbdserver_prefix: NBDSERVER_PREFIX.to_string(),
        }
    }
}

impl TapdiskPaths {
    pub fn with_device_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_prefix = prefix.into();
        self
    }

    /// Block device for a minor.
    pub fn block_device(&self, minor: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.device_prefix, minor))
    }

    /// Extract the minor from `tap-ctl allocate` output.
    pub fn minor_from_device(&self, device: &str) -> Option<u32> {
        device.strip_prefix(&self.device_prefix)?.parse().ok()
    }

    fn nbd_client_socket(&self, pid: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.nbdclient_prefix, pid))
    }

    fn nbd_server_socket(&self, pid: u32, minor: u32) -> PathBuf {
        PathBuf::from(format!("{}{}.{}", self.nbdserver_prefix, pid, minor))
    }
}

/// Drives tapdisks through a [`ControlTool`].
pub struct TapdiskManager {
    tool: Arc<dyn ControlTool>,
    mirror: Arc<dyn MirrorChannel>,
    paths: TapdiskPaths,
}

impl TapdiskManager {
    /// Create a manager with default blktap paths and Unix descriptor passing.
    pub fn new(tool: Arc<dyn ControlTool>) -> Self {
        Self {
            tool,
            mirror: Arc::new(UnixFdChannel),
            paths: TapdiskPaths::default(),
        }
    }

    pub fn with_paths(mut self, paths: TapdiskPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_mirror_channel(mut self, mirror: Arc<dyn MirrorChannel>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn paths(&self) -> &TapdiskPaths {
        &self.paths
    }

    /// Spawn a tapdisk and give it a device.
    ///
    /// If the tapdisk cannot be given a device it is sent SIGQUIT before the
    /// error is returned, so a failed spawn does not leave a process behind.
    pub fn spawn(&self) -> Result<Tapdisk, TapdiskError> {
        let output = self.tool.run(&["spawn"])?;
        let pid: u32 = output
            .trim()
            .parse()
            .map_err(|_| TapdiskError::UnexpectedOutput {
                command: "spawn".to_string(),
                output: output.clone(),
            })?;
        debug!(pid = pid, "Spawned tapdisk");

        let output = match self.tool.run(&["allocate"]) {
            Ok(output) => output,
            Err(e) => {
                self.reap(pid);
                return Err(e);
            }
        };
        let device = output.trim();
        let Some(minor) = self.paths.minor_from_device(device) else {
            self.reap(pid);
            return Err(TapdiskError::Allocation {
                pid,
                output: device.to_string(),
            });
        };

        let (minor_arg, pid_arg) = (minor.to_string(), pid.to_string());
        if let Err(e) = self.tool.run(&["attach", "-m", &minor_arg, "-p", &pid_arg]) {
            self.reap(pid);
            return Err(e);
        }

        info!(pid = pid, minor = minor, "Tapdisk allocated and attached");
        Ok(Tapdisk::new(pid, Some(minor)))
    }

    /// Open `image` in the tapdisk.
    ///
    /// With `direct_io` false the tapdisk bypasses O_DIRECT, which backing
    /// stores such as NFS need.
    pub fn open(
        &self,
        tapdisk: &mut Tapdisk,
        image: ImageDescriptor,
        direct_io: bool,
    ) -> Result<(), TapdiskError> {
        let (minor, pid) = tapdisk.ids()?;
        let arg = image.tool_arg();
        let mut args = vec![
            "open",
            "-m",
            minor.as_str(),
            "-p",
            pid.as_str(),
            "-a",
            arg.as_str(),
        ];
        if !direct_io {
            args.push("-D");
        }
        self.tool.run(&args)?;

        info!(
            pid = tapdisk.pid,
            minor = %minor,
            image = %arg,
            direct_io = direct_io,
            "Tapdisk opened image"
        );
        tapdisk.image = Some(image);
        Ok(())
    }

    /// Close the open image.
    pub fn close(&self, tapdisk: &mut Tapdisk) -> Result<(), TapdiskError> {
        let (minor, pid) = tapdisk.ids()?;
        self.tool.run(&["close", "-m", &minor, "-p", &pid])?;
        info!(pid = tapdisk.pid, minor = %minor, "Tapdisk closed image");
        tapdisk.image = None;
        Ok(())
    }

    /// Suspend I/O.
    pub fn pause(&self, tapdisk: &Tapdisk) -> Result<(), TapdiskError> {
        let (minor, pid) = tapdisk.ids()?;
        self.tool.run(&["pause", "-m", &minor, "-p", &pid])?;
        debug!(pid = tapdisk.pid, minor = %minor, "Tapdisk paused");
        Ok(())
    }

    /// Resume I/O, against the mirror destination too when one is set.
    pub fn unpause(&self, tapdisk: &Tapdisk) -> Result<(), TapdiskError> {
        let (minor, pid) = tapdisk.ids()?;
        let mut args = vec!["unpause", "-m", minor.as_str(), "-p", pid.as_str()];
        if let Some(secondary) = &tapdisk.secondary {
            args.push("-2");
            args.push(secondary.as_str());
        }
        self.tool.run(&args)?;
        debug!(
            pid = tapdisk.pid,
            minor = %minor,
            secondary = ?tapdisk.secondary,
            "Tapdisk unpaused"
        );
        Ok(())
    }

    /// Pause and destroy the tapdisk.
    ///
    /// The pause is unconditional: `tapdisk.image` may be out of date with
    /// what the process actually has open. Destroying a tapdisk that no
    /// longer exists fails with the tool's error.
    pub fn destroy(&self, tapdisk: &Tapdisk) -> Result<(), TapdiskError> {
        let (minor, pid) = tapdisk.ids()?;
        self.pause(tapdisk)?;
        self.tool.run(&["destroy", "-m", &minor, "-p", &pid])?;
        info!(pid = tapdisk.pid, minor = %minor, "Tapdisk destroyed");
        Ok(())
    }

    /// The kernel block device the tapdisk exposes.
    pub fn block_device(&self, tapdisk: &Tapdisk) -> Result<PathBuf, TapdiskError> {
        let minor = tapdisk
            .minor
            .ok_or(TapdiskError::Unallocated { pid: tapdisk.pid })?;
        Ok(self.paths.block_device(minor))
    }

    /// All tapdisks currently running on the host.
    pub fn list(&self) -> Result<Vec<ListedTapdisk>, TapdiskError> {
        let output = self.tool.run(&["list"])?;
        Ok(parse_list(&output))
    }

    /// Find the tapdisk serving `path`, comparing canonical paths.
    pub fn find_by_file<P: AsRef<Path>>(&self, path: P) -> Result<Option<Tapdisk>, TapdiskError> {
        let path = canonical_path(path);
        let found = self
            .list()?
            .into_iter()
            .filter(|listed| listed.serves(&path))
            .find_map(ListedTapdisk::into_tapdisk);
        debug!(path = %path.display(), found = ?found, "find_by_file");
        Ok(found)
    }

    /// The live listing entry for the tapdisk, if it is still running.
    pub fn find_live(&self, tapdisk: &Tapdisk) -> Result<Option<ListedTapdisk>, TapdiskError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|listed| listed.is(tapdisk.pid, tapdisk.minor)))
    }

    /// Whether the tapdisk still appears in the live listing.
    pub fn is_live(&self, tapdisk: &Tapdisk) -> Result<bool, TapdiskError> {
        Ok(self.find_live(tapdisk)?.is_some())
    }

    /// Start mirroring writes to the destination behind `fd`.
    ///
    /// The descriptor goes to the tapdisk's NBD client socket under a fresh
    /// token, then a pause/unpause cycle makes the tapdisk pick it up.
    pub fn start_mirror(&self, tapdisk: &mut Tapdisk, fd: BorrowedFd<'_>) -> Result<(), TapdiskError> {
        // The cycle needs a minor; fail before the descriptor is handed over.
        tapdisk.ids()?;
        let socket = self.paths.nbd_client_socket(tapdisk.pid);
        let token = format!("mirror-{}", Uuid::new_v4().simple());
        self.mirror.send_fd(&socket, &token, fd)?;

        let previous = tapdisk.secondary.replace(format!("nbd:{}", token));
        if let Err(e) = self.cycle(tapdisk) {
            tapdisk.secondary = previous;
            return Err(e);
        }
        info!(pid = tapdisk.pid, secondary = ?tapdisk.secondary, "Mirror started");
        Ok(())
    }

    /// Stop mirroring and resume against the primary image only.
    pub fn stop_mirror(&self, tapdisk: &mut Tapdisk) -> Result<(), TapdiskError> {
        tapdisk.secondary = None;
        self.cycle(tapdisk)?;
        info!(pid = tapdisk.pid, "Mirror stopped");
        Ok(())
    }

    /// Hand an incoming NBD connection to the tapdisk's NBD server.
    pub fn receive_mirror(&self, tapdisk: &Tapdisk, fd: BorrowedFd<'_>) -> Result<(), TapdiskError> {
        let minor = tapdisk
            .minor
            .ok_or(TapdiskError::Unallocated { pid: tapdisk.pid })?;
        let socket = self.paths.nbd_server_socket(tapdisk.pid, minor);
        let token = format!("mirror-{}", Uuid::new_v4().simple());
        self.mirror.send_fd(&socket, &token, fd)?;
        info!(pid = tapdisk.pid, minor = minor, "Mirror connection handed over");
        Ok(())
    }

    fn cycle(&self, tapdisk: &Tapdisk) -> Result<(), TapdiskError> {
        self.pause(tapdisk)?;
        self.unpause(tapdisk)
    }

    fn reap(&self, pid: u32) {
        warn!(pid = pid, "Terminating tapdisk that could not be set up");
        if let Err(e) = self.tool.terminate(pid) {
            warn!(pid = pid, error = %e, "Failed to terminate orphaned tapdisk");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::os::fd::AsFd;
    use std::sync::Mutex;

    use super::*;
    use crate::mirror::{MirrorError, UnsupportedChannel};

    /// Replays canned outputs and records every invocation.
    #[derive(Default)]
    struct Scripted {
        outputs: Mutex<VecDeque<Result<String, TapdiskError>>>,
        calls: Mutex<Vec<String>>,
        terminated: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(outputs: Vec<Result<&str, i32>>) -> Arc<Self> {
            let outputs = outputs
                .into_iter()
                .map(|o| {
                    o.map(str::to_string)
                        .map_err(|code| TapdiskError::ToolInvocation {
                            command: "tap-ctl".to_string(),
                            exit_code: Some(code),
                            stderr: "failed".to_string(),
                        })
                })
                .collect();
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ControlTool for Scripted {
        fn run(&self, args: &[&str]) -> Result<String, TapdiskError> {
            self.calls.lock().unwrap().push(args.join(" "));
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }

        fn terminate(&self, pid: u32) -> Result<(), TapdiskError> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn manager(tool: &Arc<Scripted>) -> TapdiskManager {
        TapdiskManager::new(tool.clone())
    }

    #[test]
    fn test_spawn_sequence() {
        let tool = Scripted::new(vec![Ok("4242\n"), Ok("/dev/xen/blktap-2/tapdev7\n"), Ok("")]);
        let tapdisk = manager(&tool).spawn().unwrap();

        assert_eq!(tapdisk, Tapdisk::new(4242, Some(7)));
        assert_eq!(tool.calls(), vec!["spawn", "allocate", "attach -m 7 -p 4242"]);
    }

    #[test]
    fn test_spawn_bad_allocate_output_reaps() {
        let tool = Scripted::new(vec![Ok("4242\n"), Ok("no free minors\n")]);
        let err = manager(&tool).spawn().unwrap_err();

        assert!(matches!(err, TapdiskError::Allocation { pid: 4242, .. }));
        assert_eq!(*tool.terminated.lock().unwrap(), vec![4242]);
        assert_eq!(tool.calls(), vec!["spawn", "allocate"]);
    }

    #[test]
    fn test_spawn_allocate_failure_reaps() {
        let tool = Scripted::new(vec![Ok("4242\n"), Err(1)]);
        let err = manager(&tool).spawn().unwrap_err();

        assert!(matches!(err, TapdiskError::ToolInvocation { .. }));
        assert_eq!(*tool.terminated.lock().unwrap(), vec![4242]);
    }

    #[test]
    fn test_spawn_unparseable_pid() {
        let tool = Scripted::new(vec![Ok("error: out of memory\n")]);
        let err = manager(&tool).spawn().unwrap_err();

        assert!(matches!(err, TapdiskError::UnexpectedOutput { .. }));
        assert!(tool.terminated.lock().unwrap().is_empty());
    }

    #[test]
    fn test_open_arguments() {
        let tool = Scripted::new(vec![Ok(""), Ok("")]);
        let manager = manager(&tool);
        let mut tapdisk = Tapdisk::new(10, Some(2));

        manager
            .open(&mut tapdisk, ImageDescriptor::vhd("/srv/a.vhd"), true)
            .unwrap();
        manager
            .open(&mut tapdisk, ImageDescriptor::raw("/srv/b.img"), false)
            .unwrap();

        assert_eq!(
            tool.calls(),
            vec![
                "open -m 2 -p 10 -a vhd:/srv/a.vhd",
                "open -m 2 -p 10 -a aio:/srv/b.img -D",
            ]
        );
        assert_eq!(tapdisk.image, Some(ImageDescriptor::raw("/srv/b.img")));
    }

    #[test]
    fn test_failed_open_leaves_image_unset() {
        let tool = Scripted::new(vec![Err(1)]);
        let mut tapdisk = Tapdisk::new(10, Some(2));

        assert!(manager(&tool)
            .open(&mut tapdisk, ImageDescriptor::vhd("/srv/a.vhd"), true)
            .is_err());
        assert!(tapdisk.image.is_none());
    }

    #[test]
    fn test_close_clears_image() {
        let tool = Scripted::new(vec![Ok("")]);
        let mut tapdisk = Tapdisk::new(10, Some(2));
        tapdisk.image = Some(ImageDescriptor::vhd("/srv/a.vhd"));

        manager(&tool).close(&mut tapdisk).unwrap();
        assert!(tapdisk.image.is_none());
        assert_eq!(tool.calls(), vec!["close -m 2 -p 10"]);
    }

    #[test]
    fn test_unpause_passes_secondary() {
        let tool = Scripted::new(vec![]);
        let mut tapdisk = Tapdisk::new(10, Some(2));
        tapdisk.secondary = Some("nbd:tok".to_string());

        manager(&tool).unpause(&tapdisk).unwrap();
        assert_eq!(tool.calls(), vec!["unpause -m 2 -p 10 -2 nbd:tok"]);
    }

    #[test]
    fn test_destroy_pauses_open_tapdisk() {
        let tool = Scripted::new(vec![]);
        let mut tapdisk = Tapdisk::new(10, Some(2));
        tapdisk.image = Some(ImageDescriptor::vhd("/srv/a.vhd"));

        manager(&tool).destroy(&tapdisk).unwrap();
        assert_eq!(tool.calls(), vec!["pause -m 2 -p 10", "destroy -m 2 -p 10"]);
    }

    #[test]
    fn test_destroy_unopened_tapdisk_still_pauses() {
        let tool = Scripted::new(vec![]);
        manager(&tool).destroy(&Tapdisk::new(10, Some(2))).unwrap();
        assert_eq!(tool.calls(), vec!["pause -m 2 -p 10", "destroy -m 2 -p 10"]);
    }

    #[test]
    fn test_destroy_stops_when_pause_fails() {
        let tool = Scripted::new(vec![Err(2)]);
        let err = manager(&tool)
            .destroy(&Tapdisk::new(10, Some(2)))
            .unwrap_err();
        assert!(matches!(err, TapdiskError::ToolInvocation { .. }));
        assert_eq!(tool.calls(), vec!["pause -m 2 -p 10"]);
    }

    #[test]
    fn test_unallocated_commands_do_not_run_tool() {
        let tool = Scripted::new(vec![]);
        let manager = manager(&tool);
        let mut tapdisk = Tapdisk::new(10, None);

        assert!(matches!(
            manager.pause(&tapdisk),
            Err(TapdiskError::Unallocated { pid: 10 })
        ));
        assert!(matches!(
            manager.close(&mut tapdisk),
            Err(TapdiskError::Unallocated { .. })
        ));
        assert!(matches!(
            manager.block_device(&tapdisk),
            Err(TapdiskError::Unallocated { .. })
        ));
        assert!(tool.calls().is_empty());
    }

    #[test]
    fn test_block_device() {
        let tool = Scripted::new(vec![]);
        let manager = manager(&tool);
        assert_eq!(
            manager.block_device(&Tapdisk::new(1, Some(12))).unwrap(),
            PathBuf::from("/dev/xen/blktap-2/tapdev12")
        );

        let manager = TapdiskManager::new(tool.clone())
            .with_paths(TapdiskPaths::default().with_device_prefix("/dev/td"));
        assert_eq!(
            manager.block_device(&Tapdisk::new(1, Some(3))).unwrap(),
            PathBuf::from("/dev/td3")
        );
    }

    #[test]
    fn test_minor_from_device() {
        let paths = TapdiskPaths::default();
        assert_eq!(paths.minor_from_device("/dev/xen/blktap-2/tapdev0"), Some(0));
        assert_eq!(paths.minor_from_device("/dev/xen/blktap-2/tapdevX"), None);
        assert_eq!(paths.minor_from_device("/dev/sda"), None);
    }

    #[test]
    fn test_stop_mirror_cycles() {
        let tool = Scripted::new(vec![]);
        let mut tapdisk = Tapdisk::new(10, Some(2));
        tapdisk.secondary = Some("nbd:tok".to_string());

        manager(&tool).stop_mirror(&mut tapdisk).unwrap();
        assert!(tapdisk.secondary.is_none());
        assert_eq!(tool.calls(), vec!["pause -m 2 -p 10", "unpause -m 2 -p 10"]);
    }

    #[test]
    fn test_start_mirror_unsupported_leaves_primary() {
        let tool = Scripted::new(vec![]);
        let manager = manager(&tool).with_mirror_channel(Arc::new(UnsupportedChannel));
        let mut tapdisk = Tapdisk::new(10, Some(2));
        let file = std::fs::File::open("/dev/null").unwrap();

        let err = manager
            .start_mirror(&mut tapdisk, file.as_fd())
            .unwrap_err();
        assert_eq!(err.reason_code(), "mirror_failed");
        assert!(tapdisk.secondary.is_none());
        assert!(tool.calls().is_empty());
    }

    /// Keeps every (socket, token) handed to it.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(PathBuf, String)>>,
    }

    impl RecordingChannel {
        fn sent(&self) -> Vec<(PathBuf, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MirrorChannel for RecordingChannel {
        fn send_fd(&self, socket: &Path, token: &str, _fd: BorrowedFd<'_>) -> Result<(), MirrorError> {
            self.sent
                .lock()
                .unwrap()
                .push((socket.to_path_buf(), token.to_string()));
            Ok(())
        }
    }

    fn mirror_manager(tool: &Arc<Scripted>, channel: &Arc<RecordingChannel>) -> TapdiskManager {
        TapdiskManager::new(tool.clone()).with_mirror_channel(channel.clone())
    }

    fn dev_null() -> std::fs::File {
        std::fs::File::open("/dev/null").unwrap()
    }

    #[test]
    fn test_start_mirror_sets_secondary_and_cycles() {
        let tool = Scripted::new(vec![]);
        let channel = Arc::new(RecordingChannel::default());
        let mut tapdisk = Tapdisk::new(10, Some(2));
        let file = dev_null();

        mirror_manager(&tool, &channel)
            .start_mirror(&mut tapdisk, file.as_fd())
            .unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        let (socket, token) = &sent[0];
        assert_eq!(socket, &PathBuf::from("/var/run/blktap-control/nbdclient10"));
        assert!(token.starts_with("mirror-"));
        assert_eq!(tapdisk.secondary, Some(format!("nbd:{}", token)));
        assert_eq!(
            tool.calls(),
            vec![
                "pause -m 2 -p 10".to_string(),
                format!("unpause -m 2 -p 10 -2 nbd:{}", token),
            ]
        );
    }

    #[test]
    fn test_start_mirror_restores_secondary_when_cycle_fails() {
        // pause succeeds, unpause fails
        let tool = Scripted::new(vec![Ok(""), Err(1)]);
        let channel = Arc::new(RecordingChannel::default());
        let mut tapdisk = Tapdisk::new(10, Some(2));
        tapdisk.secondary = Some("nbd:earlier".to_string());
        let file = dev_null();

        let err = mirror_manager(&tool, &channel)
            .start_mirror(&mut tapdisk, file.as_fd())
            .unwrap_err();

        assert!(matches!(err, TapdiskError::ToolInvocation { .. }));
        assert_eq!(tapdisk.secondary.as_deref(), Some("nbd:earlier"));
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn test_start_mirror_unallocated_sends_nothing() {
        let tool = Scripted::new(vec![]);
        let channel = Arc::new(RecordingChannel::default());
        let mut tapdisk = Tapdisk::new(10, None);
        let file = dev_null();

        let err = mirror_manager(&tool, &channel)
            .start_mirror(&mut tapdisk, file.as_fd())
            .unwrap_err();

        assert!(matches!(err, TapdiskError::Unallocated { pid: 10 }));
        assert!(channel.sent().is_empty());
        assert!(tapdisk.secondary.is_none());
        assert!(tool.calls().is_empty());
    }

    #[test]
    fn test_receive_mirror_uses_server_socket() {
        let tool = Scripted::new(vec![]);
        let channel = Arc::new(RecordingChannel::default());
        let tapdisk = Tapdisk::new(10, Some(2));
        let file = dev_null();

        mirror_manager(&tool, &channel)
            .receive_mirror(&tapdisk, file.as_fd())
            .unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PathBuf::from("/var/run/blktap-control/nbdserver10.2"));
        assert!(sent[0].1.starts_with("mirror-"));
        assert!(tapdisk.secondary.is_none());
        assert!(tool.calls().is_empty());
    }

    #[test]
    fn test_receive_mirror_unallocated() {
        let tool = Scripted::new(vec![]);
        let channel = Arc::new(RecordingChannel::default());
        let file = dev_null();

        let err = mirror_manager(&tool, &channel)
            .receive_mirror(&Tapdisk::new(10, None), file.as_fd())
            .unwrap_err();
        assert!(matches!(err, TapdiskError::Unallocated { .. }));
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn test_find_by_file_canonicalises() {
        let tool = Scripted::new(vec![Ok(
            "pid=1 minor=0 state=0 args=vhd:/srv/a.vhd\npid=2 minor=1 state=0 args=aio:/srv/b.img\n",
        )]);
        let found = manager(&tool)
            .find_by_file("/srv/x/../b.img")
            .unwrap()
            .unwrap();
        assert_eq!(found.pid, 2);
        assert_eq!(found.minor, Some(1));
    }
}
