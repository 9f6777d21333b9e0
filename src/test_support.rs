//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Barrier;

use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRunner};
use crate::provider::{
    InstanceHandle, InstanceProvider, InstanceState, PreflightError, PreflightFuture,
    ProviderFuture, ProvisioningError, Recipe,
};
use crate::registry::RegistryEntry;

/// Pid above the Linux and macOS pid ceilings, so never a running process.
pub const EXITED_PID: u32 = 4_194_305;

/// Scripted command runner that returns pre-seeded outputs.
///
/// Responses registered with [`ScriptedRunner::push_output_for`] are matched
/// by command fragment first; everything else is served in FIFO order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<CommandOutput>,
    keyed: Vec<(String, VecDeque<CommandOutput>)>,
    invocations: Vec<CommandInvocation>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

fn output(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Returns the rendered command strings recorded so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().responses.push_back(output(code, stdout, stderr));
    }

    /// Queues a response served only to commands containing `fragment`.
    pub fn push_output_for(
        &self,
        fragment: impl Into<String>,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        let key = fragment.into();
        let response = output(code, stdout, stderr);
        let mut state = self.lock();
        if let Some((_, queue)) = state.keyed.iter_mut().find(|(existing, _)| *existing == key) {
            queue.push_back(response);
        } else {
            state.keyed.push((key, VecDeque::from([response])));
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let rendered = invocation.command_string();
        let response = {
            let mut state = self.lock();
            state.invocations.push(invocation);
            let keyed = state
                .keyed
                .iter_mut()
                .find(|(fragment, queue)| rendered.contains(fragment.as_str()) && !queue.is_empty())
                .and_then(|(_, queue)| queue.pop_front());
            keyed.or_else(|| state.responses.pop_front())
        };
        Box::pin(async move {
            response.ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

/// Produces a JSON instance object in the tool's `compactjson` shape.
#[must_use]
pub fn json_instance(uuid: &str, name: &str, state: &str, adb: &str, recipe_uuid: &str) -> String {
    format!(
        "{{\"uuid\":\"{uuid}\",\"name\":\"{name}\",\"state\":\"{state}\",\"adb_serial\":\"{adb}\",\"recipe\":{{\"uuid\":\"{recipe_uuid}\"}}}}"
    )
}

/// Wraps a single instance object as printed by `instances start|stop`.
#[must_use]
pub fn json_instance_output(instance: &str) -> String {
    format!("{{\"instance\":{instance}}}")
}

/// Produces the payload printed by `instances list`.
#[must_use]
pub fn json_instances(instances: &[String]) -> String {
    format!("{{\"instances\":[{}]}}", instances.join(","))
}

/// Produces a structured error payload.
#[must_use]
pub fn json_error(message: &str) -> String {
    format!("{{\"error\":{{\"message\":\"{message}\",\"details\":\"\"}}}}")
}

/// Builds a recipe with placeholder hardware details.
#[must_use]
pub fn recipe(uuid: &str, name: &str) -> Recipe {
    Recipe {
        uuid: uuid.to_owned(),
        name: name.to_owned(),
        os_version: String::from("14.0"),
        hardware_profile: String::from("1080x2400 dpi 420"),
    }
}

/// Builds an online, ADB-connected instance of `recipe_uuid`.
#[must_use]
pub fn online_instance(uuid: &str, recipe_uuid: &str) -> InstanceHandle {
    InstanceHandle {
        uuid: uuid.to_owned(),
        name: format!("emulease-{uuid}"),
        adb_name: String::from("127.0.0.1:5555"),
        state: InstanceState::Online,
        recipe_uuid: Some(recipe_uuid.to_owned()),
    }
}

/// Registry entry for `handle` as written by a process that has exited.
#[must_use]
pub fn claim_of_exited_process(handle: &InstanceHandle) -> RegistryEntry {
    RegistryEntry {
        pid: Some(EXITED_PID),
        ..RegistryEntry::for_instance(handle)
    }
}

/// In-memory provider that records every call.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
    delete_barrier: Option<Arc<Barrier>>,
    list_barrier: Option<Arc<Barrier>>,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: Vec<InstanceHandle>,
    failing_deletes: BTreeSet<String>,
    fail_create: bool,
    preflight_error: Option<PreflightError>,
    create_calls: usize,
    list_calls: usize,
    connect_calls: usize,
    delete_calls: Vec<String>,
}

impl FakeProvider {
    /// Creates a provider with no live instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delete wait until `parties` deletes are in flight.
    #[must_use]
    pub fn with_delete_barrier(mut self, parties: usize) -> Self {
        self.delete_barrier = Some(Arc::new(Barrier::new(parties)));
        self
    }

    /// Makes every list wait until `parties` lists are in flight.
    #[must_use]
    pub fn with_list_barrier(mut self, parties: usize) -> Self {
        self.list_barrier = Some(Arc::new(Barrier::new(parties)));
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a live instance.
    pub fn insert_instance(&self, handle: InstanceHandle) {
        self.lock().instances.push(handle);
    }

    /// Makes deletes of `uuid` fail.
    pub fn fail_delete_for(&self, uuid: &str) {
        self.lock().failing_deletes.insert(uuid.to_owned());
    }

    /// Makes every create fail.
    pub fn fail_create(&self) {
        self.lock().fail_create = true;
    }

    /// Makes `prepare` fail with `error`.
    pub fn fail_preflight(&self, error: PreflightError) {
        self.lock().preflight_error = Some(error);
    }

    /// Snapshot of live instances.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceHandle> {
        self.lock().instances.clone()
    }

    /// Number of create calls.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Number of list calls.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Number of connect calls.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    /// Uuids passed to delete, in call order.
    #[must_use]
    pub fn delete_calls(&self) -> Vec<String> {
        self.lock().delete_calls.clone()
    }

    fn failure(operation: &str, diagnostic: String) -> ProvisioningError {
        ProvisioningError::CommandFailure {
            program: String::from("fake"),
            operation: operation.to_owned(),
            status: Some(1),
            status_text: String::from("1"),
            diagnostic,
        }
    }
}

impl InstanceProvider for FakeProvider {
    fn prepare(&self) -> PreflightFuture<'_> {
        let result = self.lock().preflight_error.clone().map_or(Ok(()), Err);
        Box::pin(async move { result })
    }

    fn create<'a>(
        &'a self,
        recipe: &'a Recipe,
        name: &'a str,
    ) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let mut state = self.lock();
            state.create_calls += 1;
            if state.fail_create {
                return Err(Self::failure("instances start", String::from("quota exceeded")));
            }
            let handle = InstanceHandle {
                uuid: format!("fake-{}", state.create_calls),
                name: name.to_owned(),
                adb_name: String::from("0.0.0.0"),
                state: InstanceState::Online,
                recipe_uuid: Some(recipe.uuid.clone()),
            };
            state.instances.push(handle.clone());
            Ok(handle)
        })
    }

    fn delete<'a>(&'a self, uuid: &'a str) -> ProviderFuture<'a, ()> {
        let barrier = self.delete_barrier.clone();
        Box::pin(async move {
            self.lock().delete_calls.push(uuid.to_owned());
            if let Some(gate) = barrier {
                gate.wait().await;
            }
            let mut state = self.lock();
            if state.failing_deletes.contains(uuid) {
                return Err(Self::failure(
                    "instances stop",
                    format!("instance {uuid} is stuck"),
                ));
            }
            state.instances.retain(|instance| instance.uuid != uuid);
            Ok(())
        })
    }

    fn list(&self) -> ProviderFuture<'_, Vec<InstanceHandle>> {
        let barrier = self.list_barrier.clone();
        Box::pin(async move {
            if let Some(gate) = barrier {
                gate.wait().await;
            }
            let mut state = self.lock();
            state.list_calls += 1;
            Ok(state.instances.clone())
        })
    }

    fn connect<'a>(&'a self, uuid: &'a str) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let mut state = self.lock();
            state.connect_calls += 1;
            let port = 10_000 + state.connect_calls;
            let instance = state
                .instances
                .iter_mut()
                .find(|instance| instance.uuid == uuid)
                .ok_or_else(|| {
                    Self::failure("instances adbconnect", format!("instance {uuid} not found"))
                })?;
            instance.adb_name = format!("127.0.0.1:{port}");
            Ok(instance.clone())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
