use crate::{ExecutionCause, ExecutionError};
use rpkg_schema::{Resource, Selector};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Everything a runner needs to evaluate one function over a resource list.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRequest {
    /// Image reference or catalog function name.
    pub function: String,
    /// Resolved function config (a KRM object), if any.
    pub config: Option<serde_yaml::Value>,
    pub selector: Selector,
    pub enable_network: bool,
    /// The selected resources, with their file path and document index.
    pub items: Vec<Resource>,
}

/// Output of a function run.
///
/// Items keep the `path`/`index` of the input they replace. An input that is
/// missing from the output was deleted by the function; an output with an
/// unknown position is a new resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionResponse {
    pub items: Vec<Resource>,
    pub results: Vec<String>,
}

pub trait FunctionRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this runner can execute `function` at all.
    fn available(&self, function: &str) -> bool;

    fn run(&self, request: &FunctionRequest) -> Result<FunctionResponse, ExecutionError>;
}

pub fn select_runner(name: &str) -> Option<Box<dyn FunctionRunner>> {
    match name {
        "builtin" => Some(Box::new(crate::builtin::BuiltinRunner::new())),
        "mock" => Some(Box::new(crate::mock::MockRunner::new())),
        _ => None,
    }
}

/// Run `request` on a worker thread, failing with a `Timeout` cause once
/// `timeout` elapses. The worker is detached and its late result dropped.
///
/// A function the runner does not offer fails before any worker starts.
pub fn run_with_timeout(
    runner: Arc<dyn FunctionRunner>,
    request: FunctionRequest,
    timeout: Duration,
) -> Result<FunctionResponse, ExecutionError> {
    if !runner.available(&request.function) {
        return Err(ExecutionError::new(
            &request,
            ExecutionCause::Sandbox(format!(
                "function image '{}' is not available to the {} runner",
                request.function,
                runner.name()
            )),
        ));
    }
    let (tx, rx) = mpsc::channel();
    let worker_request = request.clone();
    std::thread::Builder::new()
        .name("rpkg-fn".to_owned())
        .spawn(move || {
            let _ = tx.send(runner.run(&worker_request));
        })
        .map_err(|e| {
            ExecutionError::new(
                &request,
                ExecutionCause::Sandbox(format!("cannot spawn worker: {e}")),
            )
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ExecutionError::new(
            &request,
            ExecutionCause::Timeout {
                secs: timeout.as_secs(),
            },
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ExecutionError::new(
            &request,
            ExecutionCause::Sandbox("function worker exited without a result".to_owned()),
        )),
    }
}
