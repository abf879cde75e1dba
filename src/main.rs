use std::sync::Arc;

use axum::http::StatusCode;
use handler_dispatch::{
    build_dispatcher,
    config::Config,
    dependency::ServiceRegistry,
    dispatch::{Handler, Outcome, Param, Returned, RouteTable},
    errors::HandlerError,
    http::{RawRequest, ResponseWriter},
    logging, Server,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
struct Foo {
    bar: i32,
    qux: String,
}

struct FooService {
    repo: RwLock<Vec<Foo>>,
}

impl FooService {
    fn seeded() -> Self {
        let repo = (1..=3)
            .flat_map(|bar| {
                ["a", "b", "c"].map(|qux| Foo {
                    bar,
                    qux: qux.to_string(),
                })
            })
            .collect();
        Self {
            repo: RwLock::new(repo),
        }
    }

    async fn add(&self, foo: Foo) {
        self.repo.write().await.push(foo);
    }

    async fn find(&self, bar: Option<i32>, qux: Option<String>) -> Vec<Foo> {
        self.repo
            .read()
            .await
            .iter()
            .filter(|foo| bar.map_or(true, |bar| foo.bar == bar))
            .filter(|foo| qux.as_deref().map_or(true, |qux| foo.qux == qux))
            .cloned()
            .collect()
    }
}

fn routes() -> Result<RouteTable, Box<dyn std::error::Error>> {
    let list_foo = Handler::new("list_foo", |mut args| {
        let service: Arc<FooService> = args.take(0)?;
        let bar: Option<i32> = args.take(1)?;
        let qux: Option<String> = args.take(2)?;
        Ok(Returned::pending_outcome(async move {
            let found = service.find(bar, qux).await;
            Ok::<_, HandlerError>(Outcome::json(StatusCode::OK, &found)?)
        }))
    })
    .params([
        Param::infer::<FooService>("service"),
        Param::query::<Option<i32>>("bar"),
        Param::query::<Option<String>>("qux"),
    ]);

    let create_foo = Handler::new("create_foo", |mut args| {
        let service: Arc<FooService> = args.take(0)?;
        let foo: Foo = args.take(1)?;
        Ok(Returned::pending_status(async move {
            service.add(foo).await;
            Ok::<_, HandlerError>(StatusCode::CREATED)
        }))
    })
    .params([
        Param::infer::<FooService>("service"),
        Param::body::<Foo>("foo"),
    ]);

    let hello = Handler::new("hello", |mut args| {
        let response: ResponseWriter = args.take(0)?;
        Ok(Returned::pending(async move {
            response.write_json(&json!({ "message": "Hello, World!" }))?;
            Ok::<_, HandlerError>(())
        }))
    })
    .param(Param::infer::<ResponseWriter>("response"));

    let not_found = Handler::new("not_found", |mut args| {
        let request: RawRequest = args.take(0)?;
        Ok((
            StatusCode::NOT_FOUND,
            json!({ "message": "Not found!", "path": request.path() }),
        )
            .into())
    })
    .param(Param::infer::<RawRequest>("request"));

    Ok(RouteTable::builder()
        .get("/foo", list_foo)?
        .post("/foo", create_foo)?
        .get("/hello", hello)?
        .set_fallback(not_found)
        .build())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;
    let services = ServiceRegistry::new().with(FooService::seeded());
    let dispatcher = build_dispatcher(&config, routes()?, services);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        routes = dispatcher.routes().len(),
        "server starting"
    );

    Server::new(dispatcher)
        .serve_with_shutdown(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
