use clap::Parser;
use fixtures::{pds, run_server, FixtureArgs};

/// PDS (Personal Data Server) fixture server
#[derive(Parser, Debug)]
#[clap(name = "pds-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Reject DPoP proofs that do not carry the current server nonce
    #[arg(long)]
    require_nonce: bool,

    /// DID reported for the authorizing account
    #[arg(long, env = "PDS_DID", default_value = pds::DEFAULT_DID)]
    did: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    run_server(args.common, |base_url| {
        let state = pds::PdsState::new(base_url);
        state.set_require_nonce(args.require_nonce);
        state.set_did(args.did);
        pds::router(state)
    })
    .await
}
