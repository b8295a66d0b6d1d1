//! In-memory stand-in for the hypervisor tool, for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use crate::error::ProcessError;
use crate::traits::{Invocation, ProcessInvoker};
use crate::types::{CommandResult, InstanceState};

/// Simulates `lkvm` by interpreting invocations against in-memory VMs.
///
/// Listings are printed as a `PID NAME STATE MEM CPUS` table. Every call is
/// recorded, and faults can be queued per subcommand to exercise the error
/// paths of the client:
/// - exit with a chosen code and stderr
/// - exit 0 without doing anything
/// - hang until the invocation times out
pub struct MockTool {
    vms: RwLock<BTreeMap<String, MockVm>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    list_outputs: Mutex<VecDeque<String>>,
    sticky_list_output: Mutex<Option<String>>,
    calls: Mutex<Vec<Vec<String>>>,
    boot_polls: AtomicU32,
    next_pid: AtomicU32,
    installed: bool,
}

#[derive(Debug, Clone)]
struct MockVm {
    state: InstanceState,
    pid: Option<u32>,
    memory_mib: u64,
    vcpus: u32,
    /// Listings left before a booting VM reports running
    boot_polls: u32,
}

#[derive(Debug, Clone)]
enum Fault {
    Fail { code: i32, stderr: String },
    Ignore,
    Hang,
}

/// Parsed `--flag value` arguments of one invocation.
struct MockArgs<'a> {
    subcommand: &'a str,
    args: &'a [String],
}

impl<'a> MockArgs<'a> {
    fn new(invocation: &'a Invocation) -> Self {
        let (subcommand, args) = match invocation.args.split_first() {
            Some((first, rest)) => (first.as_str(), rest),
            None => ("", &invocation.args[..]),
        };
        Self { subcommand, args }
    }

    fn value(&self, flag: &str) -> Option<&'a str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }

    fn has(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }
}

fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandResult {
    CommandResult {
        exit_code: code,
        stdout: stdout.into().into_bytes(),
        stderr: stderr.into().into_bytes(),
        ..Default::default()
    }
}

fn ok() -> CommandResult {
    exit(0, "", "")
}

fn poisoned<T>(_: T) -> ProcessError {
    ProcessError::InvalidInvocation("mock tool lock poisoned".to_string())
}

fn state_word(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Running => "running",
        InstanceState::Paused => "paused",
        InstanceState::Stopped => "shut off",
        InstanceState::Creating => "creating",
        InstanceState::Destroyed => "destroyed",
        InstanceState::Unknown => "unknown",
    }
}

impl MockTool {
    /// Create a mock with no VMs.
    pub fn new() -> Self {
        info!("Creating mock hypervisor tool");
        Self {
            vms: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            list_outputs: Mutex::new(VecDeque::new()),
            sticky_list_output: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            boot_polls: AtomicU32::new(0),
            next_pid: AtomicU32::new(4000),
            installed: true,
        }
    }

    /// A mock whose executable cannot be resolved.
    pub fn not_installed() -> Self {
        Self {
            installed: false,
            ..Self::new()
        }
    }

    /// Number of listings a new VM reports `creating` before `running`.
    pub fn set_boot_polls(&self, polls: u32) {
        self.boot_polls.store(polls, Ordering::SeqCst);
    }

    /// Make the next `subcommand` exit with `code`.
    pub fn fail_next(&self, subcommand: &str, code: i32, stderr: &str) {
        self.push_fault(
            subcommand,
            Fault::Fail {
                code,
                stderr: stderr.to_string(),
            },
        );
    }

    /// Make the next `subcommand` exit 0 without changing anything.
    pub fn ignore_next(&self, subcommand: &str) {
        self.push_fault(subcommand, Fault::Ignore);
    }

    /// Make the next `subcommand` run until its timeout.
    pub fn hang_next(&self, subcommand: &str) {
        self.push_fault(subcommand, Fault::Hang);
    }

    fn push_fault(&self, subcommand: &str, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.entry(subcommand.to_string()).or_default().push_back(fault);
        }
    }

    /// Print `raw` for the next listing only.
    pub fn queue_list_output(&self, raw: &str) {
        if let Ok(mut outputs) = self.list_outputs.lock() {
            outputs.push_back(raw.to_string());
        }
    }

    /// Print `raw` for every listing until cleared with `None`.
    pub fn set_list_output(&self, raw: Option<&str>) {
        if let Ok(mut sticky) = self.sticky_list_output.lock() {
            *sticky = raw.map(str::to_string);
        }
    }

    /// Add a VM behind the client's back.
    pub fn insert_vm(&self, name: &str, state: InstanceState, memory_mib: u64, vcpus: u32) {
        let pid = state.has_process().then(|| self.allocate_pid());
        if let Ok(mut vms) = self.vms.write() {
            vms.insert(
                name.to_string(),
                MockVm {
                    state,
                    pid,
                    memory_mib,
                    vcpus,
                    boot_polls: 0,
                },
            );
        }
    }

    /// Change a VM's state behind the client's back.
    pub fn set_vm_state(&self, name: &str, state: InstanceState) {
        let pid = self.allocate_pid();
        if let Ok(mut vms) = self.vms.write() {
            if let Some(vm) = vms.get_mut(name) {
                Self::transition(vm, state, pid);
            }
        }
    }

    /// Remove a VM behind the client's back.
    pub fn remove_vm(&self, name: &str) {
        if let Ok(mut vms) = self.vms.write() {
            vms.remove(name);
        }
    }

    /// Current state of a VM as the tool sees it.
    pub fn vm_state(&self, name: &str) -> Option<InstanceState> {
        self.vms.read().ok()?.get(name).map(|vm| vm.state)
    }

    /// Argument vectors of every invocation so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Number of invocations of `subcommand` so far.
    pub fn call_count(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn transition(vm: &mut MockVm, state: InstanceState, pid: u32) {
        vm.state = state;
        if !state.has_process() {
            vm.pid = None;
        } else if vm.pid.is_none() {
            vm.pid = Some(pid);
        }
    }

    fn take_fault(&self, subcommand: &str) -> Result<Option<Fault>, ProcessError> {
        let mut faults = self.faults.lock().map_err(poisoned)?;
        Ok(faults.get_mut(subcommand).and_then(VecDeque::pop_front))
    }

    fn list(&self) -> Result<CommandResult, ProcessError> {
        if let Some(raw) = self.list_outputs.lock().map_err(poisoned)?.pop_front() {
            return Ok(exit(0, raw, ""));
        }
        if let Some(raw) = self.sticky_list_output.lock().map_err(poisoned)?.clone() {
            return Ok(exit(0, raw, ""));
        }

        let pid = self.allocate_pid();
        let mut vms = self.vms.write().map_err(poisoned)?;
        let mut out = String::from("  PID NAME                 STATE      MEM CPUS\n");
        for (name, vm) in vms.iter_mut() {
            if vm.state == InstanceState::Creating {
                if vm.boot_polls == 0 {
                    Self::transition(vm, InstanceState::Running, pid);
                } else {
                    vm.boot_polls -= 1;
                }
            }
            let pid = vm.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
            // A rootfs that was only set up has no launch resources yet
            let (mem, cpus) = if vm.memory_mib == 0 {
                ("-".to_string(), "-".to_string())
            } else {
                (vm.memory_mib.to_string(), vm.vcpus.to_string())
            };
            out.push_str(&format!(
                "{:>5} {:<20} {:<10} {:>4} {:>4}\n",
                pid,
                name,
                state_word(vm.state),
                mem,
                cpus
            ));
        }
        Ok(exit(0, out, ""))
    }

    fn create(&self, args: &MockArgs<'_>) -> Result<CommandResult, ProcessError> {
        let Some(name) = args.value("--name") else {
            return Ok(exit(1, "", "  Error: --name is required"));
        };
        let memory_mib = args.value("--mem").and_then(|v| v.parse().ok()).unwrap_or(256);
        let vcpus = args.value("--cpus").and_then(|v| v.parse().ok()).unwrap_or(1);

        let mut vms = self.vms.write().map_err(poisoned)?;
        if vms.contains_key(name) {
            return Ok(exit(1, "", format!("  Error: instance {} already exists", name)));
        }
        vms.insert(
            name.to_string(),
            MockVm {
                state: InstanceState::Creating,
                pid: None,
                memory_mib,
                vcpus,
                boot_polls: self.boot_polls.load(Ordering::SeqCst),
            },
        );
        debug!(name, memory_mib, vcpus, "Mock VM created");
        Ok(ok())
    }

    fn setup(&self, args: &MockArgs<'_>) -> Result<CommandResult, ProcessError> {
        let Some(name) = args.value("--name") else {
            return Ok(exit(1, "", "  Error: --name is required"));
        };
        let mut vms = self.vms.write().map_err(poisoned)?;
        if vms.contains_key(name) {
            return Ok(exit(1, "", format!("  Error: instance {} already exists", name)));
        }
        vms.insert(
            name.to_string(),
            MockVm {
                state: InstanceState::Stopped,
                pid: None,
                memory_mib: 0,
                vcpus: 0,
                boot_polls: 0,
            },
        );
        debug!(name, "Mock rootfs set up");
        Ok(exit(0, format!("A new rootfs '{}' has been created\n", name), ""))
    }

    fn lifecycle(&self, args: &MockArgs<'_>) -> Result<CommandResult, ProcessError> {
        use InstanceState::*;

        let pid = self.allocate_pid();
        let mut vms = self.vms.write().map_err(poisoned)?;

        if args.has("--all") {
            let (from, to): (&[InstanceState], InstanceState) = match args.subcommand {
                "stop" => (&[Running, Paused], Stopped),
                "pause" => (&[Running], Paused),
                "resume" => (&[Paused], Running),
                other => {
                    return Ok(exit(1, "", format!("  Error: {} does not accept --all", other)));
                }
            };
            for vm in vms.values_mut().filter(|vm| from.contains(&vm.state)) {
                Self::transition(vm, to, pid);
            }
            return Ok(ok());
        }

        let Some(name) = args.value("--name") else {
            return Ok(exit(1, "", "  Error: --name or --all is required"));
        };
        if args.subcommand == "destroy" {
            return Ok(match vms.remove(name) {
                Some(_) => ok(),
                None => exit(1, "", format!("  Error: no such instance: {}", name)),
            });
        }
        let Some(vm) = vms.get_mut(name) else {
            return Ok(exit(1, "", format!("  Error: no such instance: {}", name)));
        };

        let next = match (args.subcommand, vm.state) {
            ("start", Stopped | Creating) => Running,
            ("stop", Running | Paused) => Stopped,
            ("pause", Running) => Paused,
            ("resume", Paused) => Running,
            (op, state) => {
                return Ok(exit(
                    1,
                    "",
                    format!("  Error: cannot {} instance {} ({})", op, name, state_word(state)),
                ));
            }
        };
        Self::transition(vm, next, pid);
        Ok(ok())
    }

    fn balloon(&self, args: &MockArgs<'_>) -> Result<CommandResult, ProcessError> {
        let Some(name) = args.value("--name") else {
            return Ok(exit(1, "", "  Error: --name is required"));
        };
        let vms = self.vms.read().map_err(poisoned)?;
        Ok(match vms.get(name) {
            Some(vm) if vm.state == InstanceState::Running => ok(),
            Some(_) => exit(1, "", format!("  Error: instance {} is not running", name)),
            None => exit(1, "", format!("  Error: no such instance: {}", name)),
        })
    }
}

impl Default for MockTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInvoker for MockTool {
    #[instrument(skip(self, invocation), fields(subcommand = ?invocation.subcommand()))]
    async fn run(&self, invocation: &Invocation) -> Result<CommandResult, ProcessError> {
        invocation.validate()?;
        self.resolve(&invocation.program)?;

        let start = Instant::now();
        self.calls
            .lock()
            .map_err(poisoned)?
            .push(invocation.args.clone());

        let args = MockArgs::new(invocation);
        let fault = self.take_fault(args.subcommand)?;

        let result = match fault {
            Some(Fault::Fail { code, stderr }) => exit(code, "", stderr),
            Some(Fault::Ignore) => ok(),
            Some(Fault::Hang) => {
                tokio::time::sleep(invocation.timeout).await;
                return Err(ProcessError::Timeout {
                    program: invocation.program.clone(),
                    timeout: invocation.timeout,
                });
            }
            None => match args.subcommand {
                "list" => self.list()?,
                "create" | "run" | "sandbox" => self.create(&args)?,
                "setup" => self.setup(&args)?,
                "start" | "stop" | "pause" | "resume" | "destroy" => self.lifecycle(&args)?,
                "balloon" => self.balloon(&args)?,
                other => exit(1, "", format!("  Error: unknown command {:?}", other)),
            },
        };

        let result = CommandResult {
            duration: start.elapsed(),
            ..result
        };
        debug!(exit_code = result.exit_code, "Mock command completed");
        invocation.check(result)
    }

    fn resolve(&self, program: &str) -> Result<PathBuf, ProcessError> {
        if self.installed {
            Ok(PathBuf::from(program))
        } else {
            Err(ProcessError::NotFound {
                program: program.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_command_output;

    fn lkvm(args: &[&str]) -> Invocation {
        Invocation::new("lkvm").args(args.iter().copied())
    }

    async fn listing(tool: &MockTool) -> Vec<crate::types::Record> {
        let result = tool.run(&lkvm(&["list"])).await.unwrap();
        parse_command_output(&result, None).unwrap()
    }

    #[tokio::test]
    async fn test_create_boots_after_polls() {
        let tool = MockTool::new();
        tool.set_boot_polls(1);

        tool.run(&lkvm(&["create", "--name", "vm1", "--mem", "512", "--cpus", "2"]))
            .await
            .unwrap();

        let records = listing(&tool).await;
        assert_eq!(records[0].state, InstanceState::Creating);
        assert_eq!(records[0].pid, None);

        let records = listing(&tool).await;
        assert_eq!(records[0].state, InstanceState::Running);
        assert!(records[0].pid.is_some());
        assert_eq!(records[0].memory_mib, Some(512));
        assert_eq!(records[0].vcpus, Some(2));
    }

    #[tokio::test]
    async fn test_setup_lists_stopped_rootfs() {
        let tool = MockTool::new();
        tool.run(&lkvm(&["setup", "--name", "rootfs1"])).await.unwrap();

        let records = listing(&tool).await;
        assert_eq!(records[0].name, "rootfs1");
        assert_eq!(records[0].state, InstanceState::Stopped);
        assert_eq!(records[0].memory_mib, None);

        let err = tool.run(&lkvm(&["setup", "--name", "rootfs1"])).await.unwrap_err();
        assert!(matches!(err, ProcessError::NonZeroExit { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_stopped_vm_lists_as_shut_off() {
        let tool = MockTool::new();
        tool.insert_vm("vm1", InstanceState::Running, 256, 1);

        tool.run(&lkvm(&["stop", "--name", "vm1"])).await.unwrap();
        let records = listing(&tool).await;
        assert_eq!(records[0].state, InstanceState::Stopped);
        assert_eq!(records[0].pid, None);
    }

    #[tokio::test]
    async fn test_invalid_transition_exits_nonzero() {
        let tool = MockTool::new();
        tool.insert_vm("vm1", InstanceState::Stopped, 256, 1);

        let err = tool.run(&lkvm(&["pause", "--name", "vm1"])).await.unwrap_err();
        assert!(matches!(err, ProcessError::NonZeroExit { code: 1, .. }));
        assert_eq!(tool.vm_state("vm1"), Some(InstanceState::Stopped));
    }

    #[tokio::test]
    async fn test_all_flag() {
        let tool = MockTool::new();
        tool.insert_vm("vm1", InstanceState::Running, 256, 1);
        tool.insert_vm("vm2", InstanceState::Paused, 256, 1);
        tool.insert_vm("vm3", InstanceState::Stopped, 256, 1);

        tool.run(&lkvm(&["pause", "--all"])).await.unwrap();
        assert_eq!(tool.vm_state("vm1"), Some(InstanceState::Paused));

        tool.run(&lkvm(&["stop", "--all"])).await.unwrap();
        for name in ["vm1", "vm2", "vm3"] {
            assert_eq!(tool.vm_state(name), Some(InstanceState::Stopped));
        }
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let tool = MockTool::new();
        tool.insert_vm("vm1", InstanceState::Running, 256, 1);
        tool.fail_next("stop", 3, "device busy");
        tool.ignore_next("stop");

        let err = tool.run(&lkvm(&["stop", "--name", "vm1"])).await.unwrap_err();
        assert!(matches!(err, ProcessError::NonZeroExit { code: 3, .. }));

        tool.run(&lkvm(&["stop", "--name", "vm1"])).await.unwrap();
        assert_eq!(tool.vm_state("vm1"), Some(InstanceState::Running));

        tool.run(&lkvm(&["stop", "--name", "vm1"])).await.unwrap();
        assert_eq!(tool.vm_state("vm1"), Some(InstanceState::Stopped));
        assert_eq!(tool.call_count("stop"), 3);
    }

    #[tokio::test]
    async fn test_hang_times_out() {
        let tool = MockTool::new();
        tool.hang_next("list");

        let invocation = lkvm(&["list"]).timeout(Duration::from_millis(20));
        let err = tool.run(&invocation).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_list_output_overrides() {
        let tool = MockTool::new();
        tool.queue_list_output("garbage\n");
        tool.set_list_output(Some("PID NAME STATE\n"));

        let first = tool.run(&lkvm(&["list"])).await.unwrap();
        assert_eq!(first.stdout_lossy(), "garbage\n");

        let second = tool.run(&lkvm(&["list"])).await.unwrap();
        assert_eq!(second.stdout_lossy(), "PID NAME STATE\n");

        tool.set_list_output(None);
        assert!(listing(&tool).await.is_empty());
    }

    #[tokio::test]
    async fn test_not_installed() {
        let tool = MockTool::not_installed();
        assert!(tool.resolve("lkvm").is_err());
        let err = tool.run(&lkvm(&["list"])).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
        assert!(tool.calls().is_empty());
    }
}
