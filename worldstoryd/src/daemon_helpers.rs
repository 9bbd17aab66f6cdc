fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn fallback_db_path(home: &Path) -> PathBuf {
    default_db_path().unwrap_or_else(|_| {
        home.join(".local/share")
            .join("worldstory")
            .join("offline_sync.db")
    })
}

fn read_u64_env<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn token_source_for(config: &DaemonConfig) -> Arc<dyn AccessTokenSource> {
    match &config.token_file {
        Some(path) => Arc::new(FileToken::new(path)),
        None => Arc::new(EnvToken::default()),
    }
}
