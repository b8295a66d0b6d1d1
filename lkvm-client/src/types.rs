//! Type definitions for instance specs, snapshots and observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// INSTANCE STATE
// =============================================================================

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Creating,
    Running,
    Paused,
    Stopped,
    Destroyed,
    Unknown,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl InstanceState {
    /// Map a state word printed by the tool.
    ///
    /// lkvm prints `running`, `paused` and `shut off`; words nobody has
    /// taught us map to `Unknown` rather than to a guess.
    pub fn from_tool_word(word: &str) -> Self {
        let normalized = word.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "shut off" | "shutoff" | "shut-off" | "stopped" => Self::Stopped,
            "creating" | "starting" | "booting" => Self::Creating,
            "destroyed" => Self::Destroyed,
            _ => Self::Unknown,
        }
    }

    /// Lowercase name used in logs and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// `Unknown` is reachable from everywhere and may leave to any state,
    /// but only a fresh inspect is allowed to take that exit.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (_, Unknown) => true,
            (Unknown, _) => true,
            (Creating, Running) | (Creating, Stopped) => true,
            (Running, Paused) | (Running, Stopped) => true,
            (Paused, Running) | (Paused, Stopped) => true,
            (Stopped, Running) | (Stopped, Destroyed) => true,
            _ => false,
        }
    }

    /// Whether a live process (and therefore a pid) backs this state.
    pub fn has_process(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// LIFECYCLE OPERATIONS
// =============================================================================

/// A mutating lifecycle operation on an existing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOp {
    Start,
    Stop,
    Pause,
    Resume,
    Destroy,
}

impl LifecycleOp {
    /// Operation name used in messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Destroy => "destroy",
        }
    }

    /// State the instance must reach for the operation to count as done.
    pub fn target(&self) -> InstanceState {
        match self {
            Self::Start | Self::Resume => InstanceState::Running,
            Self::Stop => InstanceState::Stopped,
            Self::Pause => InstanceState::Paused,
            Self::Destroy => InstanceState::Destroyed,
        }
    }

    /// Whether the operation may be issued from `state`.
    pub fn allowed_from(&self, state: InstanceState) -> bool {
        use InstanceState::*;
        match self {
            // Creating covers retrying a boot that never came up
            Self::Start => matches!(state, Stopped | Creating),
            Self::Stop => matches!(state, Running | Paused),
            Self::Pause => state == Running,
            Self::Resume => state == Paused,
            Self::Destroy => state == Stopped,
        }
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inflate or deflate the virtio balloon by an amount in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalloonOp {
    Inflate(u64),
    Deflate(u64),
}

// =============================================================================
// INSTANCE SPEC
// =============================================================================

/// Memory and vCPU allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Number of vCPUs
    pub vcpus: u32,
}

impl ResourceSpec {
    pub fn new(memory_mib: u64, vcpus: u32) -> Self {
        Self { memory_mib, vcpus }
    }
}

/// Guest console device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    Serial,
    Virtio,
    Hv,
}

impl ConsoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleKind::Serial => "serial",
            ConsoleKind::Virtio => "virtio",
            ConsoleKind::Hv => "hv",
        }
    }
}

/// Optional virtio devices and framebuffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFlags {
    pub balloon: bool,
    pub rng: bool,
    /// virtio 9p host file sharing
    pub plan9: bool,
    pub vnc: bool,
    pub gtk: bool,
    pub sdl: bool,
    /// Disable kernel DHCP in rootfs mode
    pub no_dhcp: bool,
}

/// Request to create (and boot) a new instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    /// Unique instance name
    pub name: String,
    /// Memory and vCPU allocation
    pub resources: ResourceSpec,
    /// Kernel image to boot
    pub kernel: Option<String>,
    /// Kernel command line
    pub kernel_params: Option<String>,
    /// Initial RAM disk image
    pub initrd: Option<String>,
    /// Firmware image
    pub firmware: Option<String>,
    /// Disk image or rootfs directory
    pub disk: Option<String>,
    /// Guest NIC definition
    pub network: Option<String>,
    /// Console device
    pub console: Option<ConsoleKind>,
    /// Host shared memory exposed through a PCI device
    pub shmem: Option<String>,
    /// hugetlbfs mount path
    pub hugetlbfs: Option<String>,
    /// KVM device file
    pub kvm_dev: Option<String>,
    /// Remap a guest TTY into a host pty
    pub tty: Option<String>,
    /// Script to run when booting into a custom rootfs
    pub sandbox: Option<String>,
    /// Optional devices
    pub devices: DeviceFlags,
}

impl InstanceSpec {
    /// Create a spec with the given name and allocation.
    pub fn new(name: impl Into<String>, memory_mib: u64, vcpus: u32) -> Self {
        Self {
            name: name.into(),
            resources: ResourceSpec::new(memory_mib, vcpus),
            ..Default::default()
        }
    }

    /// Set the kernel and its command line.
    pub fn with_kernel(mut self, kernel: impl Into<String>, params: impl Into<String>) -> Self {
        self.kernel = Some(kernel.into());
        self.kernel_params = Some(params.into());
        self
    }

    /// Set the initial RAM disk.
    pub fn with_initrd(mut self, initrd: impl Into<String>) -> Self {
        self.initrd = Some(initrd.into());
        self
    }

    /// Set the disk image or rootfs directory.
    pub fn with_disk(mut self, disk: impl Into<String>) -> Self {
        self.disk = Some(disk.into());
        self
    }

    /// Set the guest network definition.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Set the console device.
    pub fn with_console(mut self, console: ConsoleKind) -> Self {
        self.console = Some(console);
        self
    }

    /// Set the optional devices.
    pub fn with_devices(mut self, devices: DeviceFlags) -> Self {
        self.devices = devices;
        self
    }

    /// Script to run when booting into a custom rootfs.
    pub fn with_sandbox(mut self, script: impl Into<String>) -> Self {
        self.sandbox = Some(script.into());
        self
    }

    /// Validate the spec before anything is sent to the tool.
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_name(&self.name)?;
        if self.resources.memory_mib == 0 {
            return Err("memory_mib must be greater than 0".to_string());
        }
        if self.resources.vcpus == 0 {
            return Err("vcpus must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Check that `name` can be passed as `--name` and read back from a listing.
pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("instance name must not be empty".to_string());
    }
    // Names are printed in whitespace-separated tables
    if name.chars().any(char::is_whitespace) {
        return Err(format!("instance name {:?} must not contain whitespace", name));
    }
    if name.starts_with('-') {
        return Err(format!("instance name {:?} must not start with '-'", name));
    }
    Ok(())
}

// =============================================================================
// OBSERVATIONS & SNAPSHOTS
// =============================================================================

/// One instance as reported by the tool's `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub memory_mib: Option<u64>,
    pub vcpus: Option<u32>,
}

impl Record {
    pub fn new(name: impl Into<String>, state: InstanceState) -> Self {
        Self {
            name: name.into(),
            state,
            pid: None,
            memory_mib: None,
            vcpus: None,
        }
    }

    /// Resources, when the output carried both columns.
    pub fn resources(&self) -> Option<ResourceSpec> {
        match (self.memory_mib, self.vcpus) {
            (Some(memory_mib), Some(vcpus)) => Some(ResourceSpec { memory_mib, vcpus }),
            _ => None,
        }
    }
}

/// Snapshot of a registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance name (identity)
    pub name: String,
    /// Current lifecycle state
    pub state: InstanceState,
    /// Host pid, only while Running or Paused
    pub pid: Option<u32>,
    /// Memory and vCPU allocation
    pub resources: ResourceSpec,
    /// When this client first saw or created the instance
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// Build a fresh entry from an observation.
    pub fn from_record(record: &Record) -> Self {
        let mut instance = Self {
            name: record.name.clone(),
            state: InstanceState::Unknown,
            pid: None,
            resources: record.resources().unwrap_or_default(),
            created_at: Utc::now(),
        };
        instance.observe(record);
        instance
    }

    /// Copy observed fields, keeping the pid invariant.
    pub(crate) fn observe(&mut self, record: &Record) {
        self.state = record.state;
        self.pid = if record.state.has_process() { record.pid } else { None };
        if let Some(resources) = record.resources() {
            self.resources = resources;
        }
    }

    /// Move to `state`, dropping the pid when no process backs it.
    pub(crate) fn set_state(&mut self, state: InstanceState) {
        self.state = state;
        if !state.has_process() {
            self.pid = None;
        }
    }
}

// =============================================================================
// PROCESS INVOCATION
// =============================================================================

/// Captured outcome of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: Vec<u8>,
    /// Captured stderr
    pub stderr: Vec<u8>,
    /// Wall-clock duration
    pub duration: Duration,
    /// Whether output exceeded the capture limit
    pub truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// What became of a command started in the background.
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    /// Still running when the early-exit window closed
    Detached { pid: Option<u32> },
    /// Exited successfully inside the window
    Exited(CommandResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_words() {
        assert_eq!(InstanceState::from_tool_word("running"), InstanceState::Running);
        assert_eq!(InstanceState::from_tool_word("shut off"), InstanceState::Stopped);
        assert_eq!(InstanceState::from_tool_word("  Paused "), InstanceState::Paused);
        assert_eq!(InstanceState::from_tool_word("zombie"), InstanceState::Unknown);
    }

    #[test]
    fn test_running_cannot_jump_to_destroyed() {
        assert!(!InstanceState::Running.can_transition_to(InstanceState::Destroyed));
        assert!(!InstanceState::Paused.can_transition_to(InstanceState::Destroyed));
        assert!(InstanceState::Stopped.can_transition_to(InstanceState::Destroyed));
        assert!(InstanceState::Running.can_transition_to(InstanceState::Unknown));
        assert!(!InstanceState::Running.can_transition_to(InstanceState::Creating));
    }

    #[test]
    fn test_op_preconditions() {
        assert!(LifecycleOp::Start.allowed_from(InstanceState::Stopped));
        assert!(LifecycleOp::Start.allowed_from(InstanceState::Creating));
        assert!(!LifecycleOp::Start.allowed_from(InstanceState::Paused));
        assert!(LifecycleOp::Stop.allowed_from(InstanceState::Paused));
        assert!(!LifecycleOp::Destroy.allowed_from(InstanceState::Running));
        assert_eq!(LifecycleOp::Resume.target(), InstanceState::Running);
    }

    #[test]
    fn test_spec_validation() {
        assert!(InstanceSpec::new("vm1", 512, 1).validate().is_ok());
        assert!(InstanceSpec::new("", 512, 1).validate().is_err());
        assert!(InstanceSpec::new("my vm", 512, 1).validate().is_err());
        assert!(InstanceSpec::new("vm1", 0, 1).validate().is_err());
        assert!(InstanceSpec::new("vm1", 512, 0).validate().is_err());
        assert!(validate_name("-vm1").is_err());
        assert!(validate_name("vm-1").is_ok());
    }

    #[test]
    fn test_pid_dropped_when_stopped() {
        let mut record = Record::new("vm1", InstanceState::Running);
        record.pid = Some(42);
        let mut instance = Instance::from_record(&record);
        assert_eq!(instance.pid, Some(42));

        instance.set_state(InstanceState::Stopped);
        assert_eq!(instance.pid, None);
    }
}
