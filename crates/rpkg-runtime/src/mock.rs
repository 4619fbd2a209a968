use crate::builtin::function_basename;
use crate::runner::{FunctionRequest, FunctionResponse, FunctionRunner};
use crate::{ExecutionCause, ExecutionError};
use serde_yaml::{Mapping, Value};
use std::sync::Mutex;

/// Annotation the mock stamps on every item it is handed.
pub const MOCK_ANNOTATION: &str = "mock.rpkg.dev/evaluated-by";

#[derive(Default)]
struct MockState {
    requests: Vec<FunctionRequest>,
    fail_next: Option<ExecutionCause>,
}

/// Records every request and annotates each item with the function name.
#[derive(Default)]
pub struct MockRunner {
    state: Mutex<MockState>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `cause`.
    pub fn fail_next(&self, cause: ExecutionCause) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = Some(cause);
        }
    }

    pub fn requests(&self) -> Vec<FunctionRequest> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().map(|state| state.requests.len()).unwrap_or(0)
    }
}

impl FunctionRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self, _function: &str) -> bool {
        true
    }

    fn run(&self, request: &FunctionRequest) -> Result<FunctionResponse, ExecutionError> {
        let mut state = self.state.lock().map_err(|e| {
            ExecutionError::new(request, ExecutionCause::Sandbox(format!("mutex poisoned: {e}")))
        })?;
        state.requests.push(request.clone());
        if let Some(cause) = state.fail_next.take() {
            return Err(ExecutionError::new(request, cause));
        }

        let name = function_basename(&request.function);
        let mut items = request.items.clone();
        for item in &mut items {
            let Some(root) = item.value.as_mapping_mut() else {
                continue;
            };
            let metadata = root
                .entry(Value::from("metadata"))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if let Some(metadata) = metadata.as_mapping_mut() {
                let annotations = metadata
                    .entry(Value::from("annotations"))
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if let Some(annotations) = annotations.as_mapping_mut() {
                    annotations.insert(Value::from(MOCK_ANNOTATION), Value::from(name));
                }
            }
        }
        Ok(FunctionResponse {
            items,
            results: vec![format!("mock evaluated {name}")],
        })
    }
}
