use driftwire::{Config, IatMode, Identity, Registry};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    const ADDRESS: &str = "127.0.0.1:9091";
    let listener = TcpListener::bind(ADDRESS).await?;
    println!("listening on address: {:?}", ADDRESS);

    let registry = Registry::with_default_transports();
    let identity = Identity::from_entropy();
    let config = Config::builder_with_identity(identity)
        .with_iat_mode(IatMode::Enabled)
        .stacked();
    let factory = registry.server_factory("stacked", config).unwrap();

    // Hand this bundle to clients out-of-band.
    println!("cert: {}", factory.args().get("cert").unwrap());
    println!("iat-mode: {}", factory.args().get("iat-mode").unwrap());

    let factory = std::sync::Arc::new(factory);
    loop {
        let (socket, addr) = listener.accept().await?;
        let factory = factory.clone();
        tokio::spawn(async move {
            let mut conn = match factory.wrap(socket).await {
                Ok(conn) => conn,
                Err(e) => {
                    println!("rejected connection from {:?}: {:?}", addr, e);
                    return Ok::<(), std::io::Error>(());
                }
            };
            println!("established disguised stream from {:?}", addr);
            loop {
                let mut buf = vec![0; 1024];
                match conn.read(&mut buf).await {
                    Ok(n) if n > 0 => {
                        println!("received message: {}", String::from_utf8_lossy(&buf[..n]));
                        conn.write_all(&buf[..n]).await?;
                        conn.flush().await?;
                    }
                    Ok(_) => {
                        println!("client closed connection: {:?}", addr);
                        return Ok(());
                    }
                    Err(e) => {
                        println!("failed to read from stream; error = {:?}", e);
                        return Err(e);
                    }
                }
            }
        });
    }
}
