//! Handler - task_type ごとの処理の登録
//!
//! # 2 つの書き方
//! - [`TaskHandler`]: `DistributedTask` をそのまま受け取る（payload は bytes）
//! - [`Handler<T>`]: [`TypedTask`] に decode 済みの値を受け取る
//!
//! `Handler<T>` は [`TypedHandler`] で包まれて `TaskHandler` になり、
//! [`HandlerRegistry`] の `HashMap<TaskType, Arc<dyn TaskHandler>>` に入ります。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::{DistributedTask, TaskType};
use crate::queue::NewTask;

/// Failure reported by a handler; becomes the task's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("payload decode: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

/// Executes one claimed task. `Ok` carries the optional result bytes.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &DistributedTask) -> Result<Option<Vec<u8>>, HandlerError>;
}

/// A task payload with a fixed task type, stored as JSON.
///
/// Naming: `{namespace}.{domain}.{action}.v{major}`.
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    fn task_type() -> TaskType {
        TaskType::new(Self::TYPE)
    }

    /// Enqueue request carrying this value as payload.
    fn to_new_task(&self) -> Result<NewTask, serde_json::Error> {
        Ok(NewTask::new(Self::task_type(), serde_json::to_vec(self)?))
    }
}

#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(&self, task: T) -> Result<Option<Vec<u8>>, HandlerError>;
}

pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, task: &DistributedTask) -> Result<Option<Vec<u8>>, HandlerError> {
        let value: T = serde_json::from_slice(&task.payload)?;
        self.handler.handle(value).await
    }
}

/// task_type -> handler. Built once at startup, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn register_typed<T, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        T: TypedTask,
        H: Handler<T> + 'static,
    {
        self.register(T::task_type(), Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::Deserialize;
    use ulid::Ulid;

    use super::*;
    use crate::domain::TaskId;

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    impl TypedTask for Resize {
        const TYPE: &'static str = "media.image.resize.v1";
    }

    struct ResizeHandler;

    #[async_trait]
    impl Handler<Resize> for ResizeHandler {
        async fn handle(&self, task: Resize) -> Result<Option<Vec<u8>>, HandlerError> {
            if task.width == 0 {
                return Err(HandlerError::new("width must be positive"));
            }
            Ok(Some(task.width.to_string().into_bytes()))
        }
    }

    fn task_with(payload: Vec<u8>) -> DistributedTask {
        DistributedTask::new(
            TaskId::from_ulid(Ulid::new()),
            "idem-1",
            Resize::task_type(),
            payload,
            0,
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn typed_handler_decodes_the_payload() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed::<Resize, _>(ResizeHandler).unwrap();
        let handler = registry.get(&Resize::task_type()).unwrap();

        let new = Resize { width: 64 }.to_new_task().unwrap();
        assert_eq!(new.task_type, Resize::task_type());
        let result = handler.handle(&task_with(new.payload)).await.unwrap();
        assert_eq!(result.as_deref(), Some(&b"64"[..]));

        let err = handler.handle(&task_with(b"{\"width\":0}".to_vec())).await.unwrap_err();
        assert_eq!(err.to_string(), "width must be positive");
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_handler_error() {
        let handler = TypedHandler::<Resize, _>::new(ResizeHandler);
        let err = handler.handle(&task_with(b"not json".to_vec())).await.unwrap_err();
        assert!(err.to_string().starts_with("payload decode"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed::<Resize, _>(ResizeHandler).unwrap();
        let err = registry.register_typed::<Resize, _>(ResizeHandler).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(t) if t == Resize::task_type()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.registered_types(), vec![Resize::task_type()]);
    }
}
