use gateway::{boot, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state = boot::boot().await?;
    server::serve(state).await
}
