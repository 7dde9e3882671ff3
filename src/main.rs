#[tokio::main]
async fn main() {
    moments::start_server().await;
}
