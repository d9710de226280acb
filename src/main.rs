use anyhow::{Context, Result};
use clap::Parser;
use entity_session::domain::{self, Member, MemberDto, Team};
use entity_session::{OrmConfig, PageRequest, Persistence, Sort};

#[derive(Parser)]
#[command(name = "entity-session-demo")]
#[command(about = "Seeds members and teams in memory and prints one page of members")]
struct Cli {
    /// Zero-based page index
    #[arg(long, default_value_t = 0)]
    page: usize,
    /// Page size; defaults to the configured size
    #[arg(long)]
    size: Option<usize>,
    /// Sort, e.g. `username,desc;age`; defaults to the configured sort
    #[arg(long)]
    sort: Option<String>,
    /// JSON configuration file; otherwise ENTITY_SESSION_* variables
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Members to seed
    #[arg(long, default_value_t = 100)]
    members: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("entity_session=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => OrmConfig::from_file(path)?,
        None => OrmConfig::from_env()?,
    };

    let persistence = Persistence::in_memory(domain::registry()?, config.clone()).await?;
    let members = persistence.member_repository()?;
    seed(&persistence, cli.members).await?;

    let sort = match &cli.sort {
        Some(text) => Sort::parse(text)?,
        None => config.paging.default_sort.clone().unwrap_or_default(),
    };
    let size = cli.size.unwrap_or(config.paging.default_page_size);
    let request = PageRequest::sorted(cli.page, size, sort);

    let session = persistence.session();
    let page = members.find_all_paged(&session, &request).await?;
    let mut content = Vec::with_capacity(page.number_of_elements());
    for member in page.content() {
        let team = session.reference::<Member, Team>(member, "team").await?;
        let team_name = team.map(|team| team.read(|team| team.name.clone()));
        content.push(MemberDto::from_member(&member.snapshot(), team_name)?);
    }
    let page = entity_session::Page::new(content, page.number(), page.size(), page.total_elements());
    session.close().await?;

    let json = serde_json::to_string_pretty(&page).context("serializing page")?;
    println!("{}", json);
    Ok(())
}

/// One team per ten members; member `i` is `user{i}` aged `i`.
async fn seed(persistence: &Persistence, count: usize) -> Result<()> {
    let session = persistence.session();
    let mut teams = Vec::new();
    for index in 0..count.div_ceil(10) {
        teams.push(session.save(Team::new(format!("team{}", index))).await?);
    }
    for index in 0..count {
        let member = session.save(Member::new(format!("user{}", index), index as i32)).await?;
        Member::change_team(&member, &teams[index / 10])?;
    }
    let written = session.commit().await?;
    tracing::info!(written, "seeded");
    Ok(())
}
