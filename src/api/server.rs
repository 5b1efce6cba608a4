use crate::admission::AdmissionController;
use crate::api::routes;
use crate::config::SharedConfig;
use crate::generate::DynGenerator;
use std::future::Future;
use std::net::SocketAddr;

#[derive(Clone)]
pub(super) struct AppState {
    pub config: SharedConfig,
    pub admission: AdmissionController,
    pub generator: DynGenerator,
}

pub fn new(
    config: SharedConfig,
    admission: AdmissionController,
    generator: DynGenerator,
    bind_addr: &SocketAddr,
) -> impl Future<Output = hyper::Result<()>> {
    axum::Server::bind(bind_addr).serve(
        routes::new(AppState {
            config,
            admission,
            generator,
        })
        .into_make_service_with_connect_info::<SocketAddr>(),
    )
}
