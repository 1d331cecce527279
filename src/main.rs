#[tokio::main]
async fn main() {
    if let Err(e) = pairline::run().await {
        eprintln!("pairline: {e}");
        std::process::exit(1);
    }
}
