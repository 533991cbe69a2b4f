// Application configuration, loaded from environment variables and CLI flags.

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Secret used to sign session JWTs.
    pub jwt_secret: String,
    /// Telegram bot token. Needed for login signature checks.
    pub bot_token: Option<String>,
    /// Skip the Telegram login widget signature check (development only).
    pub skip_telegram_signature: bool,
    /// Expected value of the `X-Telegram-Bot-Api-Secret-Token` webhook header.
    pub webhook_secret: Option<String>,
    /// Allowed CORS origin. Permissive when unset.
    pub cors_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            port: DEFAULT_PORT,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            bot_token: None,
            skip_telegram_signature: true,
            webhook_secret: None,
            cors_origin: None,
        }
    }
}

const DEFAULT_DATABASE_URL: &str = "sqlite:pingpong.db?mode=rwc";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_JWT_SECRET: &str = "pingpong-dev-secret-change-in-production";

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:pingpong.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 8000)
    /// - `JWT_SECRET` - HS256 signing secret for session tokens
    /// - `BOT_TOKEN` - Telegram bot token
    /// - `SKIP_TELEGRAM_SIGNATURE` - `false` to enforce login signature checks (default: `true`)
    /// - `TELEGRAM_WEBHOOK_SECRET` - shared secret for the bot webhook
    /// - `CORS_ORIGIN` - frontend origin allowed by CORS
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_PORT);

        let jwt_secret =
            std::env::var("JWT_SECRET").unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string());

        let bot_token = non_empty_var("BOT_TOKEN");

        let skip_telegram_signature = std::env::var("SKIP_TELEGRAM_SIGNATURE")
            .map(|v| parse_flag(&v))
            .unwrap_or(true);

        Config {
            database_url,
            port,
            jwt_secret,
            bot_token,
            skip_telegram_signature,
            webhook_secret: non_empty_var("TELEGRAM_WEBHOOK_SECRET"),
            cors_origin: non_empty_var("CORS_ORIGIN"),
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
