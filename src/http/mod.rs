//! Request and response handles shared between the dispatcher and handlers.

pub mod context;

pub use context::{
    BodyError, HeaderError, InvocationContext, RawRequest, ResponseError, ResponseWriter,
};
