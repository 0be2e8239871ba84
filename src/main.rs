#[tokio::main]
async fn main() {
    echoes::boot::boot().await;
}
