use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use threadline_backend::auth::TokenKeys;
use threadline_backend::config::ThreadlineConfig;
use threadline_backend::node::ThreadlineNode;
use threadline_backend::telemetry;
use threadline_backend::users::UserService;

#[derive(Parser)]
#[command(author, version, about = "Threadline messaging backend")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server
    Serve,
    /// Create a user account
    AddUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Print a signed bearer token for an existing user
    IssueToken {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let args = Args::parse();
    let config = ThreadlineConfig::from_env()?;
    let node = ThreadlineNode::start(config).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => node.run_http_server().await,
        Command::AddUser { username, avatar } => {
            let user = UserService::new(node.database())
                .create_user(&username, avatar)
                .await?;
            println!("created user {} (id {})", user.username, user.id);
            Ok(())
        }
        Command::IssueToken { user_id, ttl_secs } => {
            UserService::new(node.database()).require(user_id).await?;
            let keys = TokenKeys::new(&node.config().auth);
            println!("{}", keys.issue(user_id, Duration::from_secs(ttl_secs))?);
            Ok(())
        }
    }
}
