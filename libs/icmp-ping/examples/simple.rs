use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let ip = host.parse().expect("expected an IPv4 address");

    let reactor = icmp_ping::Reactor::new().expect("raw icmp socket (needs CAP_NET_RAW)");
    match reactor.ping(ip, 3).await {
        Ok(result) => {
            info!(
                alive = result.alive,
                success_percent = result.success_percent,
                avg_ms = result.avg_rtt_ms,
            );
        }
        Err(err) => error!(?err),
    };
}
