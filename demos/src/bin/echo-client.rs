use driftwire::{Registry, TransportArgs};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    const ADDRESS: &str = "127.0.0.1:9091";
    let cert = std::env::args()
        .nth(1)
        .expect("usage: echo-client <cert> [iat-mode]");
    let iat_mode = std::env::args().nth(2).unwrap_or_else(|| "1".to_owned());

    let mut args = TransportArgs::new();
    args.insert("cert", cert);
    args.insert("iat-mode", iat_mode);

    let registry = Registry::with_default_transports();
    let factory = registry.client_factory("stacked").unwrap();
    let params = factory.parse_args(&args).expect("invalid transport args");

    let mut conn = factory.dial(ADDRESS, &params).await?;
    println!("connected to server: {:?}", ADDRESS);

    for i in 1..=4 {
        conn.write_all(format!("message {}", i).as_bytes()).await?;
        conn.flush().await?;

        let mut buf = vec![0; 1024];
        match conn.read(&mut buf).await {
            Ok(n) if n > 0 => {
                println!(
                    "echo message received: {}",
                    String::from_utf8_lossy(&buf[..n])
                );
            }
            Ok(_) => {
                println!("server closed connection");
                break;
            }
            Err(e) => {
                println!("read failed: {:?}", e);
                return Err(e);
            }
        }
    }
    conn.shutdown().await?;
    Ok(())
}
