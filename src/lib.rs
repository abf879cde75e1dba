pub mod auth;
pub mod codec;
pub mod config;
pub mod dependency;
pub mod dispatch;
pub mod errors;
pub mod http;
pub mod logging;
pub mod server;

use auth::BearerTokens;
use codec::JsonCodec;
use config::Config;
use dependency::DependencyResolver;
use dispatch::{Dispatcher, RouteTable};

pub use server::Server;

/// Wires a dispatcher from the runtime configuration, the route table and
/// the dependency resolver handlers draw their services from.
pub fn build_dispatcher(
    config: &Config,
    routes: RouteTable,
    services: impl DependencyResolver + 'static,
) -> Dispatcher {
    let mut builder = Dispatcher::builder(routes)
        .resolver(services)
        .codec(JsonCodec::new(config.json_pretty))
        .max_body_bytes(config.max_body_bytes)
        .request_timeout(config.request_timeout);

    if !config.bearer_tokens.is_empty() {
        builder = builder.principal_source(BearerTokens::new(config.bearer_tokens.clone()));
    }
    builder.build()
}
