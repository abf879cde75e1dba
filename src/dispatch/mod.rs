pub mod binder;
pub mod dispatcher;
pub mod handler;
pub mod outcome;
pub mod routes;

pub use binder::{bind, Binding, Param, Parsed, Scalar, SpecialKind};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Stage, DEFAULT_MAX_BODY_BYTES};
pub use handler::{invoke, ArgError, Args, Handler};
pub use outcome::{normalize, Outcome, Returned};
pub use routes::{RouteKey, RouteTable, RouteTableBuilder};
