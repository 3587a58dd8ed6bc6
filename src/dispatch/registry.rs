use crate::dispatch::context::{RequestContext, RequestMeta};
use crate::dispatch::response::{ActionError, ActionOutput, ActionResponse};
use crate::state::{EntityStore, EntityType};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub type ActionFuture = BoxFuture<'static, Result<ActionOutput, ActionError>>;

/// 包装后的 action：接收服务句柄、只读上下文和参数
pub type ActionFn<S> =
    Arc<dyn Fn(S, Arc<RequestContext>, Vec<Value>) -> ActionFuture + Send + Sync>;

/// 分发器解析上下文时需要的 store 访问
pub trait StoreAccess: Clone + Send + Sync + 'static {
    fn store(&self) -> &EntityStore;
}

/// action 对目标实体的要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTarget {
    None,
    Optional(EntityType),
    Required(EntityType),
}

/// 把普通 async 函数包装成可以放进分发表的 ActionFn
pub fn wrap<S, F, Fut>(body: F) -> ActionFn<S>
where
    F: Fn(S, Arc<RequestContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput, ActionError>> + Send + 'static,
{
    Arc::new(move |services, ctx, args| body(services, ctx, args).boxed())
}

pub struct ActionRegistration<S> {
    pub name: &'static str,
    pub target: ContextTarget,
    pub body: ActionFn<S>,
}

impl<S> ActionRegistration<S> {
    pub fn new(name: &'static str, target: ContextTarget, body: ActionFn<S>) -> Self {
        Self { name, target, body }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action {name} is registered by both {first} and {second}")]
    DuplicateAction {
        name: String,
        first: String,
        second: String,
    },
}

/// 按 action 类收集注册项，启动时合并成一张分发表
pub struct ActionRegistry<S> {
    classes: Vec<(String, Vec<ActionRegistration<S>>)>,
}

impl<S: StoreAccess> Default for ActionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StoreAccess> ActionRegistry<S> {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
        }
    }

    pub fn register_class(
        mut self,
        class: impl Into<String>,
        actions: Vec<ActionRegistration<S>>,
    ) -> Self {
        self.classes.push((class.into(), actions));
        self
    }

    pub fn build(self, services: S) -> Result<Dispatcher<S>, RegistryError> {
        let mut table: HashMap<&'static str, RegisteredAction<S>> = HashMap::new();
        for (class, actions) in self.classes {
            for reg in actions {
                if let Some(existing) = table.get(reg.name) {
                    return Err(RegistryError::DuplicateAction {
                        name: reg.name.to_string(),
                        first: existing.class.clone(),
                        second: class,
                    });
                }
                table.insert(
                    reg.name,
                    RegisteredAction {
                        class: class.clone(),
                        target: reg.target,
                        body: reg.body,
                    },
                );
            }
        }
        debug!("dispatch table built with {} actions", table.len());
        Ok(Dispatcher {
            services,
            actions: Arc::new(table),
        })
    }
}

struct RegisteredAction<S> {
    class: String,
    target: ContextTarget,
    body: ActionFn<S>,
}

pub struct Dispatcher<S> {
    services: S,
    actions: Arc<HashMap<&'static str, RegisteredAction<S>>>,
}

impl<S: Clone> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            services: self.services.clone(),
            actions: self.actions.clone(),
        }
    }
}

impl<S: StoreAccess> Dispatcher<S> {
    pub fn services(&self) -> &S {
        &self.services
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.actions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// 执行一次 action，所有错误都在这里收敛成 Failure 响应
    pub async fn dispatch(
        &self,
        action: &str,
        entity_id: Option<&str>,
        args: Vec<Value>,
    ) -> ActionResponse {
        let request = RequestMeta::new(action, entity_id);
        debug!(
            "📨 dispatch {} [{}] id={:?} args={}",
            action,
            request.request_id,
            entity_id,
            args.len()
        );
        match self.run(request, entity_id, args).await {
            Ok(output) => ActionResponse::success(output),
            Err(e) => {
                warn!("✗ {} failed ({:?}): {}", action, e.kind(), e);
                ActionResponse::failure(&e)
            }
        }
    }

    async fn run(
        &self,
        request: RequestMeta,
        entity_id: Option<&str>,
        args: Vec<Value>,
    ) -> Result<ActionOutput, ActionError> {
        let entry = self
            .actions
            .get(request.action.as_str())
            .ok_or_else(|| ActionError::UnknownAction(request.action.clone()))?;

        let entity_id = entity_id.filter(|id| !id.is_empty());
        let store = self.services.store();
        let record = match entry.target {
            ContextTarget::None => None,
            ContextTarget::Optional(entity_type) => {
                entity_id.and_then(|id| store.snapshot(entity_type, id))
            }
            ContextTarget::Required(entity_type) => {
                let id = entity_id.ok_or_else(|| {
                    ActionError::entity(format!("No {} id given", entity_type))
                })?;
                let record = store.snapshot(entity_type, id).ok_or_else(|| {
                    ActionError::entity(format!("No {} found for id={}", entity_type, id))
                })?;
                Some(record)
            }
        };

        let ctx = Arc::new(RequestContext {
            id: entity_id.map(str::to_string),
            record,
            request,
        });
        let fut = (entry.body)(self.services.clone(), ctx, args);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ActionError::Internal(anyhow::anyhow!(
                    "action panicked: {}",
                    msg
                )))
            }
        }
    }
}

/// 读取第 index 个必填参数
pub fn arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<T, ActionError> {
    let value = args
        .get(index)
        .ok_or_else(|| ActionError::argument(format!("missing argument: {}", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ActionError::argument(format!("invalid argument {}: {}", name, e)))
}

/// 读取可选参数，缺省或 null 时返回 None
pub fn opt_arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<Option<T>, ActionError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(args, index, name).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::response::{ErrorKind, ResponseStatus};
    use crate::state::factory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TestServices {
        store: Arc<EntityStore>,
        calls: Arc<AtomicUsize>,
    }

    impl StoreAccess for TestServices {
        fn store(&self) -> &EntityStore {
            &self.store
        }
    }

    fn services() -> TestServices {
        TestServices {
            store: Arc::new(EntityStore::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn count_call(
        services: TestServices,
        ctx: Arc<RequestContext>,
        _args: Vec<Value>,
    ) -> Result<ActionOutput, ActionError> {
        services.calls.fetch_add(1, Ordering::SeqCst);
        ActionOutput::json(&json!({ "id": ctx.id }))
    }

    async fn echo_arg(
        _services: TestServices,
        _ctx: Arc<RequestContext>,
        args: Vec<Value>,
    ) -> Result<ActionOutput, ActionError> {
        let name: String = arg(&args, 0, "name")?;
        Ok(ActionOutput::message(format!("hello {}", name)))
    }

    async fn explode(
        _services: TestServices,
        _ctx: Arc<RequestContext>,
        _args: Vec<Value>,
    ) -> Result<ActionOutput, ActionError> {
        panic!("exploded");
    }

    fn registry() -> ActionRegistry<TestServices> {
        ActionRegistry::new()
            .register_class(
                "models",
                vec![ActionRegistration::new(
                    "touchModel",
                    ContextTarget::Required(EntityType::Model),
                    wrap(count_call),
                )],
            )
            .register_class(
                "misc",
                vec![
                    ActionRegistration::new("echo", ContextTarget::None, wrap(echo_arg)),
                    ActionRegistration::new("explode", ContextTarget::None, wrap(explode)),
                    ActionRegistration::new(
                        "peekModel",
                        ContextTarget::Optional(EntityType::Model),
                        wrap(count_call),
                    ),
                ],
            )
    }

    #[tokio::test]
    async fn test_missing_entity_short_circuits() {
        let services = services();
        let dispatcher = registry().build(services.clone()).unwrap();

        let resp = dispatcher
            .dispatch("touchModel", Some("does-not-exist"), vec![])
            .await;
        assert_eq!(resp.status, ResponseStatus::Failure);
        assert_eq!(resp.error_kind(), Some(ErrorKind::EntityError));
        assert_eq!(
            resp.first_message(),
            Some("No Model found for id=does-not-exist")
        );
        assert_eq!(services.calls.load(Ordering::SeqCst), 0);

        let model = services
            .store
            .add(factory::new_model("orders.sql", "select 1"))
            .unwrap();
        let resp = dispatcher.dispatch("touchModel", Some(&model.id), vec![]).await;
        assert!(resp.is_success());
        assert_eq!(resp.data, Some(json!({ "id": model.id })));
        assert_eq!(services.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_optional_target_runs_without_record() {
        let services = services();
        let dispatcher = registry().build(services.clone()).unwrap();
        let resp = dispatcher.dispatch("peekModel", Some("nope"), vec![]).await;
        assert!(resp.is_success());
        assert_eq!(services.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_become_failures() {
        let dispatcher = registry().build(services()).unwrap();

        let resp = dispatcher.dispatch("noSuchAction", None, vec![]).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::UnknownActionError));

        let resp = dispatcher.dispatch("echo", None, vec![]).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::ArgumentError));

        let resp = dispatcher.dispatch("echo", None, vec![json!("ada")]).await;
        assert_eq!(resp.first_message(), Some("hello ada"));

        let resp = dispatcher.dispatch("explode", None, vec![]).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::InternalError));
        assert!(resp.first_message().unwrap().contains("exploded"));
    }

    #[test]
    fn test_duplicate_action_names_rejected() {
        let result = registry()
            .register_class(
                "other",
                vec![ActionRegistration::new(
                    "echo",
                    ContextTarget::None,
                    wrap(echo_arg),
                )],
            )
            .build(services());
        assert_eq!(
            result.err(),
            Some(RegistryError::DuplicateAction {
                name: "echo".to_string(),
                first: "misc".to_string(),
                second: "other".to_string(),
            })
        );
    }

    #[test]
    fn test_optional_args() {
        let args = vec![json!("x"), Value::Null];
        assert_eq!(opt_arg::<String>(&args, 0, "a").unwrap(), Some("x".into()));
        assert_eq!(opt_arg::<String>(&args, 1, "b").unwrap(), None);
        assert_eq!(opt_arg::<String>(&args, 5, "c").unwrap(), None);
        assert!(opt_arg::<u32>(&args, 0, "d").is_err());
    }
}
