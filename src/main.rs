use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

use repowatch_core::{AppError, Config};
use repowatch_github::{
    GitHubClient, IssueState, IssuesScope, LocalStore, RefreshStatus, RemoteSource,
    SyncCoordinator,
};
use repowatch_view::{derive_view, FilterOption, QueryParams, SortOption};

/// List an organization's GitHub repositories from a local cache
#[derive(Parser, Debug)]
#[command(name = "repowatch", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    list: ListArgs,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Case-insensitive match on name or description
    #[arg(long, default_value = "")]
    search: String,

    /// all, java, kotlin, android, language:NAME or topic:NAME
    #[arg(long, default_value_t = FilterOption::All)]
    filter: FilterOption,

    /// name-asc, name-desc, stars-asc, stars-desc, updated-asc or updated-desc
    #[arg(long, default_value_t = SortOption::default())]
    sort: SortOption,
}

impl From<ListArgs> for QueryParams {
    fn from(args: ListArgs) -> Self {
        QueryParams {
            search_text: args.search,
            filter: args.filter,
            sort: args.sort,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a repository's issues
    Issues {
        /// Repository name within the configured organization
        repo: String,

        /// open or closed
        #[arg(default_value_t = IssueState::Open)]
        state: IssueState,
    },

    /// Delete every cached repository and issue
    ClearCache,
}

/// Fail on a surfaced refresh error; note when stale rows are being shown.
fn check_refresh(status: RefreshStatus) -> Result<()> {
    match status {
        RefreshStatus::Committed(count) => tracing::info!("Cache refreshed ({} rows)", count),
        RefreshStatus::Suppressed(error) => {
            eprintln!("Showing cached data: {}", error.user_message())
        }
        RefreshStatus::Surfaced(error) => return Err(AppError::from(error).into()),
        RefreshStatus::InFlight => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            match error.downcast_ref::<AppError>() {
                Some(app_error) => eprintln!("{}\n  {}", app_error.user_message(), app_error),
                None => eprintln!("Error: {:#}", error),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    repowatch_core::init(&config.log_filter)?;
    config.ensure_valid().map_err(AppError::from)?;

    let store =
        Arc::new(LocalStore::open(&config.cache.database_path).map_err(AppError::from)?);
    let coordinator = SyncCoordinator::new(Arc::clone(&store), &config.sync);
    let remote: Arc<dyn RemoteSource> = Arc::new(GitHubClient::new(&config.github)?);
    let organization = config.github.organization.as_str();

    tracing::info!("Repowatch started for {}", organization);

    match cli.command {
        Some(Command::ClearCache) => {
            store.clear().map_err(AppError::from)?;
            println!("Cache cleared: {}", config.cache.database_path.display());
        }
        None => {
            let params = QueryParams::from(cli.list);
            let stream = coordinator.load_repositories(remote, organization);
            check_refresh(stream.refreshed().await)?;

            let rows = store.read(stream.scope()).map_err(AppError::from)?;
            let view = derive_view(&rows, &params);
            if view.is_empty() {
                println!("No repositories match.");
            }
            for repo in view {
                println!(
                    "{:<40} {:>6}★  {:<12} {}",
                    repo.name,
                    repo.stars,
                    repo.language.as_deref().unwrap_or("-"),
                    repo.updated_at
                );
            }
        }
        Some(Command::Issues { repo, state }) => {
            let scope = IssuesScope::new(organization, repo, state);
            let stream = coordinator.load_issues(remote, scope);
            check_refresh(stream.refreshed().await)?;

            let issues = store.read(stream.scope()).map_err(AppError::from)?;
            if issues.is_empty() {
                println!("No {} issues.", state);
            }
            for issue in issues {
                println!("#{:<6} {:<60} @{}", issue.number, issue.title, issue.author.login);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_list_flags() {
        let cli = Cli::try_parse_from([
            "repowatch", "--search", "App", "--filter", "kotlin", "--sort", "stars-desc",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        let params = QueryParams::from(cli.list);
        assert_eq!(params.search_text, "App");
        assert_eq!(params.filter, FilterOption::kotlin());
        assert_eq!(params.sort, SortOption::STARS_DESC);
    }

    #[test]
    fn test_defaults_match_query_defaults() {
        let cli = Cli::try_parse_from(["repowatch"]).unwrap();
        assert_eq!(QueryParams::from(cli.list), QueryParams::default());
    }

    #[test]
    fn test_issues_subcommand() {
        let cli = Cli::try_parse_from(["repowatch", "issues", "app", "closed"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Issues { ref repo, state: IssueState::Closed }) if repo == "app"
        ));

        let cli = Cli::try_parse_from(["repowatch", "issues", "app"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Issues { state: IssueState::Open, .. })
        ));
    }

    #[test]
    fn test_help_is_displayed() {
        let err = Cli::try_parse_from(["repowatch", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_rejects_bad_values_and_stray_flags() {
        assert!(Cli::try_parse_from(["repowatch", "--sort", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["repowatch", "--filter", "language:"]).is_err());
        assert!(Cli::try_parse_from(["repowatch", "issues", "app", "pending"]).is_err());
        assert!(
            Cli::try_parse_from(["repowatch", "issues", "app", "closed", "--sort", "bogus"]).is_err()
        );
        assert!(Cli::try_parse_from(["repowatch", "--search", "x", "clear-cache"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
