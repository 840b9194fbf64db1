use crate::{
    capabilities::{CapabilityManager, SANDBOX_CAPABILITIES},
    config::LaunchConfig,
    context::{InvocationContext, PrivilegeLevel},
    namespace,
    pipeline::{self, Isolated},
    supervisor::{self, SupervisorBuilder},
};
use anyhow::Result;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Sandbox {
    config: LaunchConfig,
    context: InvocationContext,
}

impl Sandbox {
    const STACK_SIZE: usize = 1024 * 1024;

    pub fn new(config: LaunchConfig, context: InvocationContext) -> Self {
        Self { config, context }
    }

    /// Isolates, spawns the sandboxed process and waits for it. Returns the
    /// exit code to leave with.
    pub fn launch(&self) -> Result<i32> {
        self.preflight();

        let isolated = namespace::isolate(&self.config, &self.context)?;
        let act_as_init = self.config.act_as_init;

        let supervisor = SupervisorBuilder::new()
            .with_stack_size(Self::STACK_SIZE)
            .build()?;

        let process = supervisor.spawn(move || {
            if act_as_init {
                supervisor::run_as_init(|| run_pipeline(isolated))
            } else {
                run_pipeline(isolated)
            }
        })?;

        info!(pid = %process.pid(), "sandbox started");
        process.wait()
    }

    fn preflight(&self) {
        let level = self.context.privilege_level();
        debug!(?level, euid = %self.context.euid(), "privilege level");

        if level == PrivilegeLevel::Unprivileged {
            let names: Vec<_> = SANDBOX_CAPABILITIES
                .iter()
                .map(|capability| capability.to_string().to_lowercase())
                .collect();
            warn!(
                "neither root nor any capability; grant them with: sudo setcap {}+ep <rootbox>",
                names.join(",")
            );
        }

        match CapabilityManager::current() {
            Ok(snapshot) => debug!("{snapshot}"),
            Err(error) => debug!("{error:#}"),
        }

        if let Ok(missing) = CapabilityManager::missing_sandbox_capabilities() {
            if level == PrivilegeLevel::Capabilities && !missing.is_empty() {
                warn!(?missing, "some capabilities a launch needs are not permitted");
            }
        }
    }
}

/// Runs in the sandboxed process. The launch either replaces the process or
/// fails; a failure is reported here since nothing else can see it.
fn run_pipeline(isolated: Isolated<'_>) -> i32 {
    let error = pipeline::run(isolated);
    eprintln!("rootbox: {error}");
    error.exit_code()
}
