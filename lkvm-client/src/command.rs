//! Command line generation for the hypervisor tool.
//!
//! Translates client requests into argument vectors, following lkvm's flag
//! conventions (`--name`, `--all`, `--mem`, `--cpus`, ...).

use crate::config::{ClientConfig, ToolCommands};
use crate::traits::Invocation;
use crate::types::{BalloonOp, InstanceSpec, LifecycleOp};

/// Which instances a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Name(&'a str),
    All,
}

/// Builds invocations of the configured tool.
pub struct CommandBuilder<'a> {
    config: &'a ClientConfig,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a ClientConfig) -> Self {
        Self { config }
    }

    fn commands(&self) -> &ToolCommands {
        &self.config.commands
    }

    fn invocation(&self, subcommand: &str) -> Invocation {
        Invocation::new(&self.config.tool_path)
            .arg(subcommand)
            .timeout(self.config.command_timeout())
    }

    /// `list [--run] [--rootfs]`
    pub fn list(&self) -> Invocation {
        let mut invocation = self.invocation(&self.commands().list);
        if self.config.list_running {
            invocation = invocation.arg("--run");
        }
        if self.config.list_rootfs {
            invocation = invocation.arg("--rootfs");
        }
        invocation
    }

    /// Create and boot an instance from `spec`.
    pub fn create(&self, spec: &InstanceSpec) -> Invocation {
        self.invocation(&self.commands().create)
            .args(Self::launch_args(spec))
    }

    /// Boot `spec` as a sandbox running its script in the guest.
    pub fn sandbox(&self, spec: &InstanceSpec) -> Invocation {
        self.invocation(&self.commands().sandbox)
            .args(Self::launch_args(spec))
    }

    /// `setup --name N`: prepare a rootfs instance without booting it.
    pub fn setup(&self, name: &str) -> Invocation {
        self.invocation(&self.commands().setup).args(["--name", name])
    }

    /// A lifecycle command for one instance or for all of them.
    pub fn lifecycle(&self, op: LifecycleOp, target: Target<'_>) -> Invocation {
        let commands = self.commands();
        let subcommand = match op {
            LifecycleOp::Start => &commands.start,
            LifecycleOp::Stop => &commands.stop,
            LifecycleOp::Pause => &commands.pause,
            LifecycleOp::Resume => &commands.resume,
            LifecycleOp::Destroy => &commands.destroy,
        };
        let invocation = self.invocation(subcommand);
        match target {
            Target::Name(name) => invocation.args(["--name", name]),
            Target::All => invocation.arg("--all"),
        }
    }

    /// `balloon --name N --inflate|--deflate MIB`
    pub fn balloon(&self, name: &str, op: BalloonOp) -> Invocation {
        let (flag, amount) = match op {
            BalloonOp::Inflate(mib) => ("--inflate", mib),
            BalloonOp::Deflate(mib) => ("--deflate", mib),
        };
        self.invocation(&self.commands().balloon)
            .args(["--name", name, flag])
            .arg(amount.to_string())
    }

    /// Flags describing a new instance.
    pub fn launch_args(spec: &InstanceSpec) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |flag: &str, value: &str| {
            args.push(flag.to_string());
            args.push(value.to_string());
        };

        push("--name", &spec.name);
        push("--mem", &spec.resources.memory_mib.to_string());
        push("--cpus", &spec.resources.vcpus.to_string());

        let options = [
            ("--kernel", &spec.kernel),
            ("--params", &spec.kernel_params),
            ("--initrd", &spec.initrd),
            ("--firmware", &spec.firmware),
            ("--disk", &spec.disk),
            ("--network", &spec.network),
            ("--shmem", &spec.shmem),
            ("--hugetlbfs", &spec.hugetlbfs),
            ("--dev", &spec.kvm_dev),
            ("--tty", &spec.tty),
            ("--sandbox", &spec.sandbox),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                push(flag, value);
            }
        }
        if let Some(console) = spec.console {
            push("--console", console.as_str());
        }

        let devices = &spec.devices;
        let switches = [
            ("--balloon", devices.balloon),
            ("--rng", devices.rng),
            ("--9p", devices.plan9),
            ("--vnc", devices.vnc),
            ("--gtk", devices.gtk),
            ("--sdl", devices.sdl),
            ("--no-dhcp", devices.no_dhcp),
        ];
        args.extend(
            switches
                .into_iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(flag, _)| flag.to_string()),
        );

        args
    }
}
