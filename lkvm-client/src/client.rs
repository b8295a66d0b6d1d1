//! Instance lifecycle client.
//!
//! Every mutating operation follows the same shape: take the per-name lock,
//! resolve the current state, check the transition, invoke the tool, then
//! re-inspect until the target state shows up. The registry is only updated
//! from observations, never from the mere fact that a command succeeded.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandBuilder, Target};
use crate::config::ClientConfig;
use crate::error::{ClientError, ProcessError, Result, StateError};
use crate::parser;
use crate::procinfo;
use crate::process::SystemInvoker;
use crate::registry::{InstanceRegistry, NameGuard};
use crate::traits::{Invocation, ProcessInvoker};
use crate::types::{
    validate_name, BalloonOp, Instance, InstanceSpec, InstanceState, LaunchOutcome, LifecycleOp,
    Record, ResourceSpec,
};

/// Lifecycle client for instances managed by the hypervisor tool.
pub struct Client {
    config: ClientConfig,
    invoker: Arc<dyn ProcessInvoker>,
    registry: InstanceRegistry,
    /// When the last listing was reconciled; held while refreshing
    last_refresh: AsyncMutex<Option<Instant>>,
}

impl Client {
    /// Create a client that runs the tool through `invoker`.
    pub fn new(config: ClientConfig, invoker: Arc<dyn ProcessInvoker>) -> Result<Self> {
        config.validate()?;
        info!(tool = %config.tool_path, "Creating lifecycle client");
        Ok(Self {
            config,
            invoker,
            registry: InstanceRegistry::new(),
            last_refresh: AsyncMutex::new(None),
        })
    }

    /// Create a client that spawns the real tool.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let invoker = Arc::new(SystemInvoker::from_config(&config));
        Self::new(config, invoker)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn commands(&self) -> CommandBuilder<'_> {
        CommandBuilder::new(&self.config)
    }

    /// Whether the configured tool resolves to an executable.
    pub fn is_supported(&self) -> bool {
        match self.invoker.resolve(&self.config.tool_path) {
            Ok(path) => {
                debug!(path = %path.display(), "Hypervisor tool found");
                true
            }
            Err(e) => {
                debug!(error = %e, "Hypervisor tool not available");
                false
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Registry snapshot of one instance. Never calls the tool.
    pub fn get(&self, name: &str) -> Result<Instance> {
        self.registry.get(name)
    }

    /// Reconcile with the tool and return every known instance, by name.
    ///
    /// Refreshes closer together than `refresh_interval` are served from the
    /// registry, and callers arriving during a refresh share its result.
    #[instrument(skip(self))]
    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.refresh().await?;
        self.registry.list()
    }

    async fn refresh(&self) -> Result<()> {
        let requested = Instant::now();
        let mut last = self.last_refresh.lock().await;

        if let Some(at) = *last {
            if at >= requested || at.elapsed() < self.config.refresh_interval() {
                debug!("Listing is fresh, skipping refresh");
                return Ok(());
            }
        }

        // Anything mutated after this point is newer than the listing
        let since = self.registry.generation();
        let records = self.read_listing(None).await?;
        let diff = self.registry.reconcile(records, since)?;
        if !diff.skipped.is_empty() {
            debug!(skipped = ?diff.skipped, "Names busy during reconcile");
        }
        *last = Some(Instant::now());
        Ok(())
    }

    /// Fresh observation of one instance.
    ///
    /// An instance the tool no longer lists is marked `Unknown` and reported
    /// as not found.
    #[instrument(skip(self))]
    pub async fn inspect(&self, name: &str) -> Result<Instance> {
        let guard = self.registry.lock(name).await?;
        self.observe(&guard, None).await
    }

    async fn observe(&self, guard: &NameGuard, deadline: Option<Instant>) -> Result<Instance> {
        let name = guard.name();
        match self.inspect_record(name, deadline).await? {
            Some(record) if record.state != InstanceState::Destroyed => {
                self.registry.record_inspection(guard, &record)
            }
            Some(_) => {
                self.registry.evict(guard)?;
                Err(StateError::NotFound(name.to_string()).into())
            }
            None => {
                self.registry.mark_unknown(guard)?;
                Err(StateError::NotFound(name.to_string()).into())
            }
        }
    }

    async fn inspect_record(&self, name: &str, deadline: Option<Instant>) -> Result<Option<Record>> {
        let records = self.read_listing(deadline).await?;
        Ok(records.into_iter().find(|record| record.name == name))
    }

    /// Run `list` and parse it, retrying once on malformed output.
    async fn read_listing(&self, deadline: Option<Instant>) -> Result<Vec<Record>> {
        let mut retried = false;
        let mut records = loop {
            let invocation = self.commands().list().timeout(self.budget(deadline)?);
            let result = self.invoker.run(&invocation).await?;
            match parser::parse_command_output(&result, None) {
                Ok(records) => break records,
                Err(e) if !retried => {
                    warn!(error = %e, "Unparseable listing, retrying once");
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if self.config.probe_process_cmdline {
            records = tokio::task::spawn_blocking(move || {
                procinfo::complete_records(&mut records);
                records
            })
            .await
            .map_err(|e| ClientError::Internal(format!("process probe failed: {}", e)))?;
        }

        Ok(records)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create and boot an instance.
    ///
    /// The instance is registered only once the tool reports it running;
    /// any failure leaves no entry behind. With `detach_create` set the
    /// command is started in the background and only watched for an early
    /// exit, for tools whose create command stays in the foreground as the VM.
    #[instrument(skip(self, spec), fields(name = %spec.name, memory_mib = spec.resources.memory_mib, vcpus = spec.resources.vcpus))]
    pub async fn create(&self, spec: &InstanceSpec) -> Result<Instance> {
        spec.validate().map_err(ClientError::InvalidConfig)?;
        let invocation = self.commands().create(spec);
        self.provision(
            &spec.name,
            invocation,
            self.config.detach_create,
            InstanceState::Running,
            Some(spec.resources),
        )
        .await
    }

    /// Boot a sandbox that runs `spec.sandbox` inside the guest.
    ///
    /// The tool's sandbox command is the VM process, so it is always
    /// launched in the background.
    #[instrument(skip(self, spec), fields(name = %spec.name, script = ?spec.sandbox))]
    pub async fn sandbox(&self, spec: &InstanceSpec) -> Result<Instance> {
        spec.validate().map_err(ClientError::InvalidConfig)?;
        let invocation = self.commands().sandbox(spec);
        self.provision(&spec.name, invocation, true, InstanceState::Running, Some(spec.resources))
            .await
    }

    /// Prepare a rootfs instance without booting it.
    ///
    /// The new instance is registered as `Stopped`; `start` boots it.
    #[instrument(skip(self))]
    pub async fn setup(&self, name: &str) -> Result<Instance> {
        validate_name(name).map_err(ClientError::InvalidConfig)?;
        let invocation = self.commands().setup(name);
        self.provision(name, invocation, false, InstanceState::Stopped, None)
            .await
    }

    /// Bring a new instance into existence and register it at `target`.
    async fn provision(
        &self,
        name: &str,
        invocation: Invocation,
        detach: bool,
        target: InstanceState,
        resources: Option<ResourceSpec>,
    ) -> Result<Instance> {
        let guard = self.registry.lock(name).await?;
        if self.registry.contains(name)? {
            return Err(StateError::AlreadyExists(name.to_string()).into());
        }

        let invocation = invocation.timeout(self.budget(None)?);
        if detach {
            info!(subcommand = ?invocation.subcommand(), "Launching instance");
            match self.invoker.launch(&invocation, self.config.launch_window()).await? {
                LaunchOutcome::Detached { pid } => debug!(pid = ?pid, "Launch detached"),
                LaunchOutcome::Exited(_) => debug!("Launch command exited"),
            }
        } else {
            info!(subcommand = ?invocation.subcommand(), "Creating instance");
            self.invoker.run(&invocation).await?;
        }

        let observed = self
            .settle(name, InstanceState::Creating, target, None)
            .await?;
        match observed {
            Some(mut record) if record.state == target => {
                if let Some(resources) = resources {
                    record.memory_mib.get_or_insert(resources.memory_mib);
                    record.vcpus.get_or_insert(resources.vcpus);
                }
                let instance = Instance::from_record(&record);
                self.registry.insert(&guard, instance.clone())?;
                info!(state = %instance.state, pid = ?instance.pid, "Instance registered");
                Ok(instance)
            }
            other => {
                let observed = other.map(|r| r.state).unwrap_or(InstanceState::Unknown);
                warn!(expected = %target, observed = %observed, "Instance did not come up");
                Err(StateError::StateMismatch {
                    name: name.to_string(),
                    expected: target,
                    observed,
                }
                .into())
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn start(&self, name: &str) -> Result<Instance> {
        self.apply(name, LifecycleOp::Start, None).await
    }

    pub async fn stop(&self, name: &str) -> Result<Instance> {
        self.apply(name, LifecycleOp::Stop, None).await
    }

    pub async fn pause(&self, name: &str) -> Result<Instance> {
        self.apply(name, LifecycleOp::Pause, None).await
    }

    pub async fn resume(&self, name: &str) -> Result<Instance> {
        self.apply(name, LifecycleOp::Resume, None).await
    }

    /// Destroy a stopped instance and forget it.
    ///
    /// The returned snapshot is in state `Destroyed`; afterwards `get`
    /// reports the name as not found.
    pub async fn destroy(&self, name: &str) -> Result<Instance> {
        self.apply(name, LifecycleOp::Destroy, None).await
    }

    /// Run a lifecycle operation, finishing before `deadline` if one is given.
    ///
    /// Already being in the target state is success without a tool call.
    /// If the deadline passes after the command was issued, the instance is
    /// marked `Unknown` and `ProcessError::Timeout` is returned.
    #[instrument(skip(self, op, deadline), fields(op = %op))]
    pub async fn apply(
        &self,
        name: &str,
        op: LifecycleOp,
        deadline: Option<Instant>,
    ) -> Result<Instance> {
        let guard = self.registry.lock(name).await?;
        let current = self.resolve_current(&guard, deadline).await?;

        if current.state == op.target() {
            debug!(state = %current.state, "Already in target state");
            return Ok(current);
        }
        if !op.allowed_from(current.state) {
            return Err(StateError::InvalidTransition {
                name: name.to_string(),
                from: current.state,
                op: op.as_str(),
            }
            .into());
        }

        info!(from = %current.state, "Issuing lifecycle command");
        let invocation = self
            .commands()
            .lifecycle(op, Target::Name(name))
            .timeout(self.budget(deadline)?);
        self.invoke_guarded(&guard, &invocation).await?;

        let observed = match self.settle(name, current.state, op.target(), deadline).await {
            Ok(observed) => observed,
            Err(e) => {
                // The command ran but its effect is unconfirmed
                self.registry.mark_unknown(&guard)?;
                return Err(e);
            }
        };

        self.commit(&guard, op, observed)
    }

    /// Registry state of the guarded name, inspected first when unknown.
    async fn resolve_current(&self, guard: &NameGuard, deadline: Option<Instant>) -> Result<Instance> {
        match self.registry.get(guard.name()) {
            Ok(instance) if instance.state != InstanceState::Unknown => Ok(instance),
            Ok(_) => self.observe(guard, deadline).await,
            Err(e) if e.is_not_found() => self.observe(guard, deadline).await,
            Err(e) => Err(e),
        }
    }

    /// Invoke a command that changes the guarded instance.
    async fn invoke_guarded(&self, guard: &NameGuard, invocation: &Invocation) -> Result<()> {
        match self.invoker.run(invocation).await {
            Ok(_) => Ok(()),
            Err(e @ ProcessError::Timeout { .. }) => {
                self.registry.mark_unknown(guard)?;
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "Command failed, state unchanged");
                Err(e.into())
            }
        }
    }

    /// Record the post-command observation and judge the outcome.
    fn commit(&self, guard: &NameGuard, op: LifecycleOp, observed: Option<Record>) -> Result<Instance> {
        let name = guard.name();
        let target = op.target();

        let record = match observed {
            Some(record) if record.state != InstanceState::Destroyed => record,
            gone => {
                if target == InstanceState::Destroyed {
                    let evicted = self.registry.evict(guard)?;
                    info!("Instance destroyed");
                    let mut instance = evicted.unwrap_or_else(|| {
                        Instance::from_record(&Record::new(name, InstanceState::Destroyed))
                    });
                    instance.set_state(InstanceState::Destroyed);
                    return Ok(instance);
                }
                let observed = match gone {
                    Some(_) => {
                        self.registry.evict(guard)?;
                        InstanceState::Destroyed
                    }
                    None => {
                        self.registry.mark_unknown(guard)?;
                        InstanceState::Unknown
                    }
                };
                return Err(StateError::StateMismatch {
                    name: name.to_string(),
                    expected: target,
                    observed,
                }
                .into());
            }
        };

        let instance = self.registry.record_inspection(guard, &record)?;
        if instance.state == target {
            info!(state = %instance.state, "Lifecycle operation confirmed");
            Ok(instance)
        } else {
            warn!(expected = %target, observed = %instance.state, "Tool succeeded but state disagrees");
            Err(StateError::StateMismatch {
                name: name.to_string(),
                expected: target,
                observed: instance.state,
            }
            .into())
        }
    }

    /// Poll the listing until `name` reaches `target`.
    ///
    /// Polling continues while the instance still shows `from`, is booting,
    /// or is missing (unless `Destroyed` is the target). Returns the last
    /// observation when the settle window closes first, and a timeout error
    /// when the caller's deadline does.
    async fn settle(
        &self,
        name: &str,
        from: InstanceState,
        target: InstanceState,
        deadline: Option<Instant>,
    ) -> Result<Option<Record>> {
        let started = Instant::now();
        let window = started + self.config.settle_timeout();
        let poll = self.config.poll_interval();
        let mut polls = 0u32;

        loop {
            let observed = self.inspect_record(name, deadline).await?;
            polls += 1;

            let state = observed.as_ref().map(|record| record.state);
            let reached = match state {
                Some(state) => state == target,
                None => target == InstanceState::Destroyed,
            };
            let in_transit = match state {
                Some(state) => state == from || state == InstanceState::Creating,
                None => true,
            };
            if reached || !in_transit {
                debug!(polls, observed = ?state, "Settled");
                return Ok(observed);
            }

            let next = Instant::now() + poll;
            if next >= window && deadline.map_or(true, |d| window <= d) {
                debug!(polls, observed = ?state, "Settle window closed");
                return Ok(observed);
            }
            if deadline.is_some_and(|d| next >= d) {
                return Err(self.deadline_exceeded(started.elapsed()));
            }
            tokio::time::sleep(poll).await;
        }
    }

    // =========================================================================
    // Bulk and device operations
    // =========================================================================

    /// Stop every instance with one `--all` invocation.
    pub async fn stop_all(&self) -> Result<Vec<Instance>> {
        self.apply_all(LifecycleOp::Stop).await
    }

    /// Pause every running instance with one `--all` invocation.
    pub async fn pause_all(&self) -> Result<Vec<Instance>> {
        self.apply_all(LifecycleOp::Pause).await
    }

    /// Resume every paused instance with one `--all` invocation.
    pub async fn resume_all(&self) -> Result<Vec<Instance>> {
        self.apply_all(LifecycleOp::Resume).await
    }

    #[instrument(skip(self))]
    async fn apply_all(&self, op: LifecycleOp) -> Result<Vec<Instance>> {
        // Name order, so two bulk operations cannot deadlock
        let mut guards = Vec::new();
        for name in self.registry.names()? {
            guards.push(self.registry.lock(&name).await?);
        }

        info!(instances = guards.len(), "Issuing bulk lifecycle command");
        let invocation = self.commands().lifecycle(op, Target::All);
        match self.invoker.run(&invocation).await {
            Ok(_) => {}
            Err(e @ ProcessError::Timeout { .. }) => {
                for guard in &guards {
                    self.registry.mark_unknown(guard)?;
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        let since = self.registry.generation();
        let records = match self.read_listing(None).await {
            Ok(records) => records,
            Err(e) => {
                for guard in &guards {
                    self.registry.mark_unknown(guard)?;
                }
                return Err(e);
            }
        };

        for guard in &guards {
            match records.iter().find(|record| record.name == guard.name()) {
                Some(record) if record.state == InstanceState::Destroyed => {
                    self.registry.evict(guard)?;
                }
                Some(record) => {
                    self.registry.record_inspection(guard, record)?;
                }
                None => self.registry.mark_unknown(guard)?,
            }
        }
        // Guarded names are skipped here; this picks up everything else
        self.registry.reconcile(records, since)?;
        drop(guards);

        self.registry.list()
    }

    /// Inflate or deflate the balloon of a running instance.
    #[instrument(skip(self))]
    pub async fn balloon(&self, name: &str, op: BalloonOp) -> Result<()> {
        let amount = match op {
            BalloonOp::Inflate(mib) | BalloonOp::Deflate(mib) => mib,
        };
        if amount == 0 {
            return Err(ClientError::InvalidConfig(
                "balloon amount must be greater than 0".to_string(),
            ));
        }

        let guard = self.registry.lock(name).await?;
        let current = self.resolve_current(&guard, None).await?;
        if current.state != InstanceState::Running {
            return Err(StateError::InvalidTransition {
                name: name.to_string(),
                from: current.state,
                op: "balloon",
            }
            .into());
        }

        let invocation = self.commands().balloon(name, op);
        self.invoker.run(&invocation).await?;
        info!("Balloon adjusted");
        Ok(())
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    /// Timeout for the next invocation: the configured one, capped by the
    /// time left before `deadline`.
    fn budget(&self, deadline: Option<Instant>) -> Result<Duration> {
        let timeout = self.config.command_timeout();
        let Some(deadline) = deadline else {
            return Ok(timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.deadline_exceeded(Duration::ZERO));
        }
        Ok(timeout.min(remaining))
    }

    fn deadline_exceeded(&self, waited: Duration) -> ClientError {
        ProcessError::Timeout {
            program: self.config.tool_path.clone(),
            timeout: waited,
        }
        .into()
    }
}
