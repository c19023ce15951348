use bucket_watch::observability::{init_tracing, LogFormat};
use bucket_watch::{BucketClient, BucketConfig, ChangeOrigin};
use std::path::{Path, PathBuf};
use tracing::info;

const USAGE: &str = "usage: bucket-watch <watch | put <key> <file> | get <key> <file>>";

/// `BUCKET_WATCH_CONFIG` names a TOML file; without it the bucket is the
/// `./bucket` directory.
fn load_config() -> Result<BucketConfig, Box<dyn std::error::Error>> {
    let config = match std::env::var("BUCKET_WATCH_CONFIG") {
        Ok(path) => BucketConfig::from_file(Path::new(&path))?,
        Err(_) => BucketConfig::local(PathBuf::from("bucket")),
    };
    Ok(config.with_env_overrides()?)
}

async fn watch(client: &BucketClient) -> Result<(), Box<dyn std::error::Error>> {
    client.on_new_file(|event| {
        let origin = match event.origin {
            ChangeOrigin::Local => "local",
            ChangeOrigin::External => "external",
        };
        match event.last_modified {
            Some(ts) => println!("{} {} (modified {})", origin, event.file_name, ts),
            None => println!("{} {}", origin, event.file_name),
        }
        Ok(())
    });

    client.start().await;
    println!("Watching for changes, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    client.stop().await;
    Ok(())
}

async fn put(client: &BucketClient, key: &str, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let len = tokio::fs::metadata(file).await?.len();
    if len > client.chunk_size() as u64 {
        let reader = tokio::fs::File::open(file).await?;
        client.write_large(key, reader).await?;
    } else {
        let data = tokio::fs::read(file).await?;
        client.write(key, data).await?;
    }
    println!("Wrote {} ({} bytes)", key, len);
    Ok(())
}

async fn get(client: &BucketClient, key: &str, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = client.read_large(key).await?;
    let mut out = tokio::fs::File::create(file).await?;
    let copied = tokio::io::copy(&mut reader, &mut out).await?;
    println!("Read {} ({} bytes) into {}", key, copied, file.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::from_env());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config()?;
    let client = BucketClient::from_config(&config).await?;
    info!("Using {:?} store", config.store_type);

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["watch"] => watch(&client).await?,
        ["put", key, file] => put(&client, key, Path::new(file)).await?,
        ["get", key, file] => get(&client, key, Path::new(file)).await?,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
    Ok(())
}
