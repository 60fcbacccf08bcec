mod dispatcher;
mod engine;
mod events;
mod host;
mod plug;
mod settings;
mod store;
mod watchdog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
