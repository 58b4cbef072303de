use super::*;

mod connect;

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    #[command(about = "Connect to configured servers and track their chain tip")]
    Connect(connect::Connect),
}

impl Subcommand {
    pub(crate) async fn run(self, settings: Settings, cancel: CancellationToken) -> Result {
        match self {
            Self::Connect(connect) => connect.run(settings, cancel).await,
        }
    }
}
