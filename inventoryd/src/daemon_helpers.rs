fn log_notification(store: &InventoryStore, notification: &Notification) {
    for alert in &notification.alerts {
        match alert {
            Alert::ParseFailure { object_id, message } => {
                tracing::warn!(object = ?object_id, %message, "server sent unreadable data");
            }
            Alert::FetchExhausted { id, reason } => {
                tracing::warn!(%id, %reason, "gave up fetching");
            }
        }
    }
    tracing::debug!(
        mask = ?notification.mask,
        changed = notification.changed_ids.len(),
        folders = store.category_count(),
        items = store.item_count(),
        "inventory changed"
    );
}

fn required_var<F>(var: &F, name: &str) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("{name} is not set"))
}

fn required_uuid<F>(var: &F, name: &str) -> anyhow::Result<Uuid>
where
    F: Fn(&str) -> Option<String>,
{
    optional_uuid(var, name)?.with_context(|| format!("{name} is not set"))
}

fn optional_uuid<F>(var: &F, name: &str) -> anyhow::Result<Option<Uuid>>
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            Uuid::parse_str(value.trim()).with_context(|| format!("{name} is not a valid id: {value}"))
        })
        .transpose()
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_CACHE_DIR_NAME)
}

/// Positive numbers only; anything else falls back to `default`.
fn read_number<T>(value: Option<String>, default: T) -> T
where
    T: FromStr + PartialOrd + Default,
{
    value
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

fn read_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
