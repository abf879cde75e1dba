//! Parameter binding.
//!
//! Each handler parameter is described once, at registration time, by a
//! [`Param`]: its name, the Rust type it binds to and where the value comes
//! from. At dispatch time [`bind`] turns one descriptor into one value.

use std::{
    any::{type_name, Any, TypeId},
    fmt,
    str::FromStr,
};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    auth::Principal,
    codec::{self, BodyCodec, CodecError},
    dependency::{DependencyResolver, Instance},
    errors::DispatchError,
    http::{BodyError, InvocationContext, RawRequest, ResponseWriter},
};

pub(crate) type BoundValue = Box<dyn Any + Send>;

type ScalarConverter = fn(Option<&str>) -> Result<BoundValue, String>;
type BodyDecoder = fn(&dyn BodyCodec, &[u8]) -> Result<BoundValue, CodecError>;
type Downcast = fn(Instance) -> Option<BoundValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Body,
    /// Query string key; `None` uses the parameter name.
    Query(Option<String>),
    /// Header name; `None` uses the parameter name.
    Header(Option<String>),
    Special(SpecialKind),
    Injected,
}

/// Values injected straight from the invocation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Cancellation,
    Request,
    Response,
    Principal,
}

impl SpecialKind {
    pub fn of<T: 'static>() -> Option<Self> {
        let id = TypeId::of::<T>();
        if id == TypeId::of::<CancellationToken>() {
            Some(Self::Cancellation)
        } else if id == TypeId::of::<RawRequest>() {
            Some(Self::Request)
        } else if id == TypeId::of::<ResponseWriter>() {
            Some(Self::Response)
        } else if id == TypeId::of::<Option<Principal>>() {
            Some(Self::Principal)
        } else {
            None
        }
    }

    fn type_name(self) -> &'static str {
        match self {
            Self::Cancellation => type_name::<CancellationToken>(),
            Self::Request => type_name::<RawRequest>(),
            Self::Response => type_name::<ResponseWriter>(),
            Self::Principal => type_name::<Option<Principal>>(),
        }
    }
}

/// Types a query or header string can be converted into.
pub trait Scalar: Send + Sized + 'static {
    /// Value used when the key is absent.
    fn missing() -> Self;

    fn parse(raw: &str) -> Result<Self, String>;
}

macro_rules! numeric_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scalar for $ty {
                fn missing() -> Self {
                    <$ty>::default()
                }

                fn parse(raw: &str) -> Result<Self, String> {
                    raw.trim().parse::<$ty>().map_err(|err| err.to_string())
                }
            }
        )*
    };
}

numeric_scalar!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl Scalar for bool {
    fn missing() -> Self {
        false
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err("expected `true` or `false`".to_string())
        }
    }
}

impl Scalar for String {
    fn missing() -> Self {
        String::new()
    }

    fn parse(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

impl Scalar for Uuid {
    fn missing() -> Self {
        Uuid::nil()
    }

    fn parse(raw: &str) -> Result<Self, String> {
        Uuid::parse_str(raw.trim()).map_err(|err| err.to_string())
    }
}

impl<T: Scalar> Scalar for Option<T> {
    fn missing() -> Self {
        None
    }

    fn parse(raw: &str) -> Result<Self, String> {
        T::parse(raw).map(Some)
    }
}

/// Binds any `FromStr` type, typically an enumeration. A missing key binds
/// `T::default()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Parsed<T>(pub T);

impl<T> Scalar for Parsed<T>
where
    T: FromStr + Default + Send + 'static,
    T::Err: fmt::Display,
{
    fn missing() -> Self {
        Parsed(T::default())
    }

    fn parse(raw: &str) -> Result<Self, String> {
        raw.trim()
            .parse::<T>()
            .map(Parsed)
            .map_err(|err| err.to_string())
    }
}

#[derive(Clone)]
enum Source {
    Body(BodyDecoder),
    Query {
        key: Option<String>,
        convert: ScalarConverter,
    },
    Header {
        key: Option<String>,
        convert: ScalarConverter,
    },
    Special(SpecialKind),
    Injected {
        type_id: TypeId,
        downcast: Downcast,
    },
}

/// Binding descriptor for one handler parameter.
#[derive(Clone)]
pub struct Param {
    name: String,
    type_name: &'static str,
    source: Source,
}

impl Param {
    pub fn query<T: Scalar>(name: impl Into<String>) -> Self {
        Self::new::<T>(
            name,
            Source::Query {
                key: None,
                convert: convert_scalar::<T>,
            },
        )
    }

    pub fn query_as<T: Scalar>(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new::<T>(
            name,
            Source::Query {
                key: Some(key.into()),
                convert: convert_scalar::<T>,
            },
        )
    }

    pub fn header<T: Scalar>(name: impl Into<String>) -> Self {
        Self::new::<T>(
            name,
            Source::Header {
                key: None,
                convert: convert_scalar::<T>,
            },
        )
    }

    pub fn header_as<T: Scalar>(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self::new::<T>(
            name,
            Source::Header {
                key: Some(header.into()),
                convert: convert_scalar::<T>,
            },
        )
    }

    /// Body-bound parameter. A blank body binds `T::default()`.
    pub fn body<T>(name: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        Self::new::<T>(name, Source::Body(decode_body::<T>))
    }

    pub fn injected<T: Send + Sync + 'static>(name: impl Into<String>) -> Self {
        Self::new::<T>(
            name,
            Source::Injected {
                type_id: TypeId::of::<T>(),
                downcast: downcast_instance::<T>,
            },
        )
    }

    /// Parameter without a binding annotation: special types are injected
    /// from the context, anything else goes to the dependency resolver.
    pub fn infer<T: Send + Sync + 'static>(name: impl Into<String>) -> Self {
        match SpecialKind::of::<T>() {
            Some(kind) => Self::special(name, kind),
            None => Self::injected::<T>(name),
        }
    }

    pub fn special(name: impl Into<String>, kind: SpecialKind) -> Self {
        Self {
            name: name.into(),
            type_name: kind.type_name(),
            source: Source::Special(kind),
        }
    }

    fn new<T>(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            type_name: type_name::<T>(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn binding(&self) -> Binding {
        match &self.source {
            Source::Body(_) => Binding::Body,
            Source::Query { key, .. } => Binding::Query(key.clone()),
            Source::Header { key, .. } => Binding::Header(key.clone()),
            Source::Special(kind) => Binding::Special(*kind),
            Source::Injected { .. } => Binding::Injected,
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("binding", &self.binding())
            .finish()
    }
}

/// Resolves one parameter of `handler` against the current request.
pub async fn bind(
    param: &Param,
    ctx: &InvocationContext,
    resolver: &dyn DependencyResolver,
    handler: &str,
) -> Result<BoundValue, DispatchError> {
    match &param.source {
        Source::Body(decode) => {
            let bytes = ctx
                .request()
                .bytes()
                .await
                .map_err(|err| body_fault(param, err))?;
            decode(ctx.codec(), &bytes).map_err(|err| DispatchError::MalformedBody {
                param: param.name.clone(),
                reason: err.to_string(),
            })
        }
        Source::Query { key, convert } => {
            let key = key.as_deref().unwrap_or(&param.name);
            convert_raw(param, ctx.query_value(key), *convert)
        }
        Source::Header { key, convert } => {
            let key = key.as_deref().unwrap_or(&param.name);
            let raw = ctx
                .header_value(key)
                .map_err(|err| DispatchError::Binding {
                    param: param.name.clone(),
                    reason: err.to_string(),
                    value: err.raw,
                })?;
            convert_raw(param, raw, *convert)
        }
        Source::Special(kind) => Ok(special_value(*kind, ctx)),
        Source::Injected { type_id, downcast } => resolver
            .resolve(*type_id)
            .and_then(downcast)
            .ok_or_else(|| DispatchError::UnresolvedDependency {
                type_name: param.type_name,
                handler: handler.to_string(),
            }),
    }
}

fn convert_raw(
    param: &Param,
    raw: Option<String>,
    convert: ScalarConverter,
) -> Result<BoundValue, DispatchError> {
    convert(raw.as_deref()).map_err(|reason| DispatchError::Binding {
        param: param.name.clone(),
        value: raw.unwrap_or_default(),
        reason,
    })
}

fn special_value(kind: SpecialKind, ctx: &InvocationContext) -> BoundValue {
    match kind {
        SpecialKind::Cancellation => Box::new(ctx.cancellation().clone()),
        SpecialKind::Request => Box::new(ctx.request().clone()),
        SpecialKind::Response => Box::new(ctx.response().clone()),
        SpecialKind::Principal => Box::new(ctx.principal().cloned()),
    }
}

fn body_fault(param: &Param, err: BodyError) -> DispatchError {
    match err {
        BodyError::TooLarge { limit } => DispatchError::PayloadTooLarge { limit },
        BodyError::Cancelled => DispatchError::Cancelled,
        other => DispatchError::MalformedBody {
            param: param.name.clone(),
            reason: other.to_string(),
        },
    }
}

fn convert_scalar<T: Scalar>(raw: Option<&str>) -> Result<BoundValue, String> {
    match raw {
        None => Ok(Box::new(T::missing())),
        Some(raw) => T::parse(raw).map(|value| Box::new(value) as BoundValue),
    }
}

fn decode_body<T>(codec: &dyn BodyCodec, bytes: &[u8]) -> Result<BoundValue, CodecError>
where
    T: DeserializeOwned + Default + Send + 'static,
{
    if codec::is_blank(bytes) {
        return Ok(Box::new(T::default()));
    }
    codec::decode_as::<T>(codec, bytes).map(|value| Box::new(value) as BoundValue)
}

fn downcast_instance<T: Send + Sync + 'static>(instance: Instance) -> Option<BoundValue> {
    instance
        .downcast::<T>()
        .ok()
        .map(|service| Box::new(service) as BoundValue)
}
