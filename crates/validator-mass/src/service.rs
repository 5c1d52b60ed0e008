//! Helpers for a request/response front end (HTTP or otherwise): schema
//! merging, the submit flow and an error taxonomy that maps onto status codes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use validator_core::PluginRegistry;
use validator_types::{ExecutorKind, ValidatorError};

use crate::manager::{MassManager, MassOptions};
use crate::queue::{MassQueue, UpdateSchemaRequest};

/// Errors surfaced to service callers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The request cannot be resolved or cooked. Nothing ran.
    #[error("{message} (at '{path}')")]
    Unprocessable { path: String, message: String },

    /// The batch ran but did not pass, or the engine failed while running it.
    #[error("{message}")]
    Execution { message: String },
}

impl ServiceError {
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Unprocessable { .. } => 422,
            ServiceError::Execution { .. } => 500,
        }
    }
}

impl From<ValidatorError> for ServiceError {
    fn from(err: ValidatorError) -> Self {
        if err.is_validation() {
            ServiceError::Unprocessable {
                path: err.field_path().unwrap_or_default().to_string(),
                message: err.to_string(),
            }
        } else {
            ServiceError::Execution {
                message: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassResponse {
    pub completed_schemas: Vec<Value>,
}

/// Recursively override `base` with `overrides`. Objects merge key by key;
/// any other value replaces what was there.
pub fn merge_schema(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => merge_schema(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

/// Where a submitted batch is registered while it runs.
pub struct QueueBinding {
    pub queue: Arc<MassQueue>,
    pub queue_id: String,
}

/// Merge `request` over `base`, run the resulting batch and return every
/// completed job schema.
pub async fn submit_request(
    registry: &PluginRegistry,
    base: &Value,
    request: &Value,
    kind: ExecutorKind,
    mut options: MassOptions,
    binding: Option<QueueBinding>,
) -> Result<MassResponse, ServiceError> {
    let mut schema = base.clone();
    merge_schema(&mut schema, request);

    if let Some(binding) = &binding {
        options.queue_id = Some(binding.queue_id.clone());
    }
    let manager = Arc::new(MassManager::from_schemas(registry, &[schema], kind, options).await?);
    if let Some(binding) = &binding {
        binding.queue.enqueue(&binding.queue_id, manager.clone());
    }

    let outcome = manager.run().await;
    if let Some(binding) = &binding {
        binding.queue.remove_manager(&binding.queue_id, manager.id());
    }
    let finished = outcome?;

    if !finished.passed {
        return Err(ServiceError::Execution {
            message: format!(
                "The validation did not complete successfully: {}",
                finished.messages.join("; ")
            ),
        });
    }
    Ok(MassResponse {
        completed_schemas: manager.schemas(),
    })
}

/// Apply an update received as a raw body (`{"queue_id": .., "schema": {..}}`).
pub fn handle_update(queue: &MassQueue, body: &Value) -> Result<bool, ServiceError> {
    let request: UpdateSchemaRequest =
        serde_json::from_value(body.clone()).map_err(|e| ServiceError::Unprocessable {
            path: String::new(),
            message: e.to_string(),
        })?;
    if request.result().is_none() {
        return Err(ServiceError::Unprocessable {
            path: "schema".to_string(),
            message: "the schema carries no result".to_string(),
        });
    }
    Ok(queue.update_from_wire(&request))
}
