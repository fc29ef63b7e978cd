use std::io::{self, BufRead};
use std::path::PathBuf;

use backoffice::company::CompanyError;
use backoffice::config::{ClientConfig, ConfigError, Timeouts};
use backoffice::error::{ClientError, Notice};
use backoffice::guard::GuardDecision;
use backoffice::listing::{DateRange, InvalidDate, Pagination, TruckFilter};
use backoffice::menu::{Menu, MenuEntry, MenuKind};
use backoffice::preferences::{Language, TruckColumn};
use backoffice::resources::{ListQuery, TruckQuery};
use backoffice::storage::StorageError;
use backoffice::Backoffice;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Company(#[from] CompanyError),
    #[error(transparent)]
    Date(#[from] InvalidDate),
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("page {page} does not exist; the list has {last} page(s)")]
    PageOutOfRange { page: usize, last: usize },
    #[error("not logged in; run `backoffice login <username>` first")]
    NotLoggedIn,
    #[error("failed to read password: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "backoffice", about = "Logistics back-office session and navigation CLI")]
struct Cli {
    #[arg(long, env = "BACKOFFICE_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "BACKOFFICE_STATE_PATH")]
    state_path: Option<PathBuf>,

    #[arg(long, env = "BACKOFFICE_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate and persist the session.
    Login {
        username: String,
        #[arg(long, env = "BACKOFFICE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Logout,
    Whoami,
    Refresh,
    AccountStatus {
        username: String,
    },
    Health,
    Company(CompanyCommand),
    /// Ask the guard whether the current session may open a path.
    Route {
        path: String,
    },
    Menu {
        #[arg(long)]
        location: Option<String>,
    },
    Trucks(TrucksCommand),
    Companies(CompaniesCommand),
    Users(UsersCommand),
    Columns(ColumnsCommand),
    Language(LanguageCommand),
}

#[derive(Args, Debug)]
struct CompanyCommand {
    #[command(subcommand)]
    command: CompanySubcommand,
}

#[derive(Subcommand, Debug)]
enum CompanySubcommand {
    Get,
    Set { id: String },
}

#[derive(Args, Debug)]
struct TrucksCommand {
    #[command(subcommand)]
    command: TrucksSubcommand,
}

#[derive(Subcommand, Debug)]
enum TrucksSubcommand {
    List(TruckListArgs),
}

#[derive(Args, Debug)]
struct TruckListArgs {
    #[arg(long, default_value = "")]
    warehouse: String,
    #[arg(long, default_value = "")]
    carrier: String,
    #[arg(long, default_value = "")]
    facility: String,
    #[arg(long, default_value = "")]
    status: String,
    /// Backend-side filter on the customer id.
    #[arg(long)]
    customer: Option<i64>,
    /// Backend-side filter on the load number.
    #[arg(long)]
    load_number: Option<String>,
    #[arg(long)]
    ship_from: Option<String>,
    #[arg(long)]
    ship_to: Option<String>,
    #[arg(long)]
    deliv_from: Option<String>,
    #[arg(long)]
    deliv_to: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = backoffice::listing::DEFAULT_PAGE_SIZE)]
    page_size: usize,
}

#[derive(Args, Debug)]
struct CompaniesCommand {
    #[command(subcommand)]
    command: CompaniesSubcommand,
}

#[derive(Subcommand, Debug)]
enum CompaniesSubcommand {
    List {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = backoffice::resources::DEFAULT_LIMIT)]
        limit: u32,
        /// Include inactive companies.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
}

#[derive(Args, Debug)]
struct UsersCommand {
    #[command(subcommand)]
    command: UsersSubcommand,
}

#[derive(Subcommand, Debug)]
enum UsersSubcommand {
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
}

#[derive(Args, Debug)]
struct ColumnsCommand {
    #[command(subcommand)]
    command: ColumnsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ColumnsSubcommand {
    Show,
    Toggle { column: String },
    All,
    None,
    Common,
}

#[derive(Args, Debug)]
struct LanguageCommand {
    #[command(subcommand)]
    command: LanguageSubcommand,
}

#[derive(Subcommand, Debug)]
enum LanguageSubcommand {
    Get,
    Set { code: Language },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let app = Backoffice::open(&config)?;

    match cli.command {
        Command::Login { username, password } => run_login(&app, &username, password).await,
        Command::Logout => {
            app.logout().await;
            println!("logged out");
            Ok(())
        }
        Command::Whoami => run_whoami(&app),
        Command::Refresh => {
            let session = app.auth().refresh_token().await?;
            println!("token refreshed for {}", session.username());
            Ok(())
        }
        Command::AccountStatus { username } => {
            let status = app.auth().account_status(&username).await?;
            println!(
                "{}: exists={} active={} locked={} failed_attempts={}",
                status.username, status.exists, status.is_active, status.is_locked, status.failed_attempts
            );
            if let Some(until) = status.lockout_end {
                println!("locked until {until}");
            }
            Ok(())
        }
        Command::Health => {
            let health = app.auth().health().await?;
            println!("{}", if health.is_healthy() { "ok" } else { health.status.as_str() });
            Ok(())
        }
        Command::Company(company) => run_company(&app, company),
        Command::Route { path } => {
            run_route(&app, &path);
            Ok(())
        }
        Command::Menu { location } => {
            let location = location.unwrap_or_else(|| app.navigator().current().path);
            print_menu(&app.menu(), &location);
            Ok(())
        }
        Command::Trucks(trucks) => match trucks.command {
            TrucksSubcommand::List(args) => run_trucks_list(&app, args).await,
        },
        Command::Companies(companies) => run_companies(&app, companies).await,
        Command::Users(users) => run_users(&app, users).await,
        Command::Columns(columns) => run_columns(&app, columns),
        Command::Language(language) => run_language(&app, language),
    }
}

fn build_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.api_url {
        config.api_url = ClientConfig::new(url)?.api_url;
    }
    if let Some(path) = &cli.state_path {
        config.state_path.clone_from(path);
    }
    if let Some(secs) = cli.request_timeout_secs {
        config.timeouts = Timeouts { request_secs: Some(secs), ..config.timeouts };
    }
    Ok(config)
}

async fn run_login(app: &Backoffice, username: &str, password: Option<String>) -> Result<(), CliError> {
    let password = match password {
        Some(password) => password,
        None => {
            eprint!("password: ");
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_owned()
        }
    };

    match app.login(username, &password).await {
        Ok((session, decision)) => {
            println!("logged in as {}", session.username());
            if let GuardDecision::Allow = decision {
                println!("now at {}", app.navigator().current());
            }
            Ok(())
        }
        Err(e) => {
            let notice = Notice::for_login_failure(&e);
            tracing::debug!(kind = %notice.kind, error = %e, "login failed");
            Err(CliError::LoginFailed(notice.message))
        }
    }
}

fn run_whoami(app: &Backoffice) -> Result<(), CliError> {
    let session = app.auth().current_session().ok_or(CliError::NotLoggedIn)?;
    print_json(&serde_json::to_value(session.user())?)?;
    println!("company: {}", app.company().get());
    Ok(())
}

fn run_company(app: &Backoffice, company: CompanyCommand) -> Result<(), CliError> {
    match company.command {
        CompanySubcommand::Get => println!("{}", app.company().get()),
        CompanySubcommand::Set { id } => {
            app.company().set(&id)?;
            println!("selected company {id}");
        }
    }
    Ok(())
}

fn run_route(app: &Backoffice, path: &str) {
    match app.guard().navigate(path) {
        GuardDecision::Allow => println!("allow {path}"),
        GuardDecision::RedirectToLogin { .. } | GuardDecision::RedirectToUnauthorized => {
            println!("redirect {}", app.navigator().current());
        }
    }
}

fn print_menu(menu: &Menu, location: &str) {
    fn walk(entries: &[MenuEntry], location: &str, depth: usize) {
        for entry in entries {
            let marker = if entry.is_active(location) { '*' } else { ' ' };
            let indent = "  ".repeat(depth);
            match &entry.kind {
                MenuKind::Leaf { route } => {
                    println!("{marker} {indent}{} [{}] -> {route}", entry.label_key, entry.icon.as_str());
                }
                MenuKind::Branch { children, .. } => {
                    println!("{marker} {indent}{} [{}]", entry.label_key, entry.icon.as_str());
                    walk(children, location, depth + 1);
                }
            }
        }
    }
    if menu.entries().is_empty() {
        println!("(no entries; log in first)");
    }
    walk(menu.entries(), location, 0);
}

async fn run_trucks_list(app: &Backoffice, args: TruckListArgs) -> Result<(), CliError> {
    if !app.auth().is_authenticated() {
        return Err(CliError::NotLoggedIn);
    }
    let company = app.company().get();
    let id_empresa = company.parse().ok();
    if id_empresa.is_none() {
        tracing::warn!(%company, "selected company id is not numeric; listing every company");
    }
    let query = TruckQuery {
        id_empresa,
        id_customer: args.customer,
        load_number: args.load_number,
        ..TruckQuery::default()
    };
    let trucks = app.trucks().list(&query).await?;

    let filter = TruckFilter {
        id_empresa: String::new(),
        id_warehouse: args.warehouse,
        carrier: args.carrier,
        customer_facility: args.facility,
        estatus: args.status,
        ship_date: DateRange::parse(args.ship_from.as_deref(), args.ship_to.as_deref())?,
        deliv_date: DateRange::parse(args.deliv_from.as_deref(), args.deliv_to.as_deref())?,
    };
    let matching = filter.apply(&trucks);
    let mut pages = Pagination::new(args.page_size);
    pages.reset(matching.len());
    if !pages.has_page(args.page) {
        return Err(CliError::PageOutOfRange { page: args.page, last: pages.total_pages().max(1) });
    }
    pages.go_to(args.page);

    let columns = app.columns().visible_columns();
    let header: Vec<&str> = columns.iter().map(|c| c.key()).collect();
    println!("{}", header.join("\t"));
    for truck in pages.slice(&matching) {
        let row: Vec<String> = columns.iter().map(|c| truck.cell(*c)).collect();
        println!("{}", row.join("\t"));
    }
    let window: Vec<String> = pages.page_numbers().iter().map(ToString::to_string).collect();
    eprintln!(
        "page {} of {} ({} trucks) [{}]",
        pages.page(),
        pages.total_pages().max(1),
        pages.total(),
        window.join(" ")
    );
    Ok(())
}

async fn run_companies(app: &Backoffice, companies: CompaniesCommand) -> Result<(), CliError> {
    match companies.command {
        CompaniesSubcommand::List { skip, limit, all } => {
            let mut query = ListQuery::page(skip, limit);
            if all {
                query = query.include_inactive();
            }
            let list = app.companies().list(&query).await?;
            print_json(&serde_json::to_value(&list)?)?;
        }
    }
    Ok(())
}

async fn run_users(app: &Backoffice, users: UsersCommand) -> Result<(), CliError> {
    match users.command {
        UsersSubcommand::List { search, all } => {
            let mut query = ListQuery::default();
            if let Some(term) = search {
                query = query.search(term);
            }
            if all {
                query = query.include_inactive();
            }
            let list = app.users().list(&query).await?;
            print_json(&serde_json::to_value(&list)?)?;
        }
    }
    Ok(())
}

fn run_columns(app: &Backoffice, columns: ColumnsCommand) -> Result<(), CliError> {
    let mut visibility = app.columns();
    match columns.command {
        ColumnsSubcommand::Show => {}
        ColumnsSubcommand::Toggle { column } => {
            let column = TruckColumn::from_key(&column).ok_or(CliError::UnknownColumn(column))?;
            visibility.toggle(column);
        }
        ColumnsSubcommand::All => visibility.select_all(),
        ColumnsSubcommand::None => visibility.deselect_all(),
        ColumnsSubcommand::Common => visibility.select_common(),
    }
    app.save_columns(&visibility)?;
    for column in TruckColumn::ALL {
        let mark = if visibility.is_visible(column) { 'x' } else { ' ' };
        println!("[{mark}] {column}");
    }
    println!("{} of {} visible", visibility.visible_count(), TruckColumn::ALL.len());
    Ok(())
}

fn run_language(app: &Backoffice, language: LanguageCommand) -> Result<(), CliError> {
    match language.command {
        LanguageSubcommand::Get => {
            let current = app.language();
            println!("{} ({})", current.code(), current.name());
        }
        LanguageSubcommand::Set { code } => {
            app.set_language(code)?;
            println!("language set to {}", code.name());
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
