pub mod artifacts;
pub mod catalog;
pub mod http;
pub mod objects;

pub use artifacts::ArtifactClient;
pub use catalog::CatalogClient;
pub use http::HttpService;
pub use objects::ObjectClient;

#[cfg(test)]
pub(crate) mod test_server {
    use axum::Router;

    /// 在随机端口上启动一个本地 HTTP 服务，返回其地址
    pub async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
