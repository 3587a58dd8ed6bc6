pub mod context;
pub mod registry;
pub mod response;

pub use context::{RequestContext, RequestMeta};
pub use registry::{
    arg, opt_arg, wrap, ActionFn, ActionRegistration, ActionRegistry, ContextTarget, Dispatcher,
    RegistryError, StoreAccess,
};
pub use response::{
    ActionError, ActionOutput, ActionResponse, ErrorKind, MessageType, ResponseMessage,
    ResponseStatus,
};
