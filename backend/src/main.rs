#[tokio::main]
async fn main() {
    registry::start_server().await;
}
