//! Cluster configuration persistence.
//!
//! The on-disk format is a generated INI file with `[director]`,
//! `[cache]`, `[bucket=NAME]`, and `[backend=NAME]` sections. It is
//! rewritten atomically whenever an admin mutation changes durable state,
//! and loading a missing file seeds it with the current defaults.

use crate::backend::BackendRole;
use crate::cluster::{Cluster, ClusterInner};
use crate::error::ConfigError;
use crate::ini::IniFile;
use crate::transport::{BackendSpec, SocketSpec};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::{info, warn};

impl Cluster {
    /// Binds the cluster to `path` and loads the configuration stored
    /// there. A missing file initializes the store from the current state.
    pub fn load_file(&self, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        self.inner().load_from(path.into())
    }

    /// Rewrites the bound configuration file.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.inner().save_to_storage()
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.inner().storage_path.lock().clone()
    }
}

impl ClusterInner {
    pub(crate) fn save_to_storage(&self) -> Result<(), ConfigError> {
        let path = self
            .storage_path
            .lock()
            .clone()
            .ok_or(ConfigError::NoStoragePath)?;
        self.to_ini().write_atomic(&path)
    }

    fn to_ini(&self) -> IniFile {
        let mut ini = IniFile::new();
        let config = self.config.read().clone();

        ini.set("director", "enabled", bool_str(config.enabled));
        ini.set("director", "queue-limit", config.queue_limit.to_string());
        ini.set(
            "director",
            "queue-timeout",
            config.queue_timeout.as_secs().to_string(),
        );
        ini.set(
            "director",
            "on-client-abort",
            config.on_client_abort.to_string(),
        );
        ini.set(
            "director",
            "retry-after",
            config.retry_after.as_secs().to_string(),
        );
        ini.set(
            "director",
            "max-retry-count",
            config.max_retry_count.to_string(),
        );
        ini.set(
            "director",
            "sticky-offline-mode",
            bool_str(config.sticky_offline_mode),
        );
        ini.set(
            "director",
            "allow-x-sendfile",
            bool_str(config.allow_x_sendfile),
        );
        ini.set(
            "director",
            "enqueue-on-unavailable",
            bool_str(config.enqueue_on_unavailable),
        );
        ini.set(
            "director",
            "connect-timeout",
            config.connect_timeout.as_secs().to_string(),
        );
        ini.set(
            "director",
            "read-timeout",
            config.read_timeout.as_secs().to_string(),
        );
        ini.set(
            "director",
            "write-timeout",
            config.write_timeout.as_secs().to_string(),
        );
        ini.set(
            "director",
            "health-check-host-header",
            config.health_check.host_header.clone(),
        );
        ini.set(
            "director",
            "health-check-request-path",
            config.health_check.request_path.clone(),
        );
        ini.set(
            "director",
            "health-check-fcgi-script-filename",
            config.health_check.fcgi_script_filename.clone(),
        );
        ini.set("director", "scheduler", config.scheduler.to_string());

        if let Some(cache) = &self.cache {
            ini.set("cache", "enabled", bool_str(cache.enabled()));
            ini.set(
                "cache",
                "deliver-active",
                bool_str(cache.deliver_active_enabled()),
            );
            ini.set(
                "cache",
                "deliver-shadow",
                bool_str(cache.deliver_shadow_enabled()),
            );
            ini.set(
                "cache",
                "default-ttl",
                cache.default_ttl().as_secs().to_string(),
            );
            ini.set(
                "cache",
                "default-shadow-ttl",
                cache.default_shadow_ttl().as_secs().to_string(),
            );
        }

        {
            let shaper = self.shaper.lock();
            for bucket in shaper.top_buckets() {
                let section = format!("bucket={}", shaper.name(bucket));
                ini.set(&section, "rate", format_fraction(shaper.rate_fraction(bucket)));
                ini.set(&section, "ceil", format_fraction(shaper.ceil_fraction(bucket)));
            }
        }

        for backend in self.backends.read().iter().flatten() {
            // terminate is a transient drain state, not configuration
            if backend.role() == BackendRole::Terminate {
                continue;
            }

            let section = format!("backend={}", backend.name());
            ini.set(&section, "role", backend.role().to_string());
            ini.set(&section, "capacity", backend.capacity().to_string());
            ini.set(&section, "enabled", bool_str(backend.is_enabled()));
            ini.set(
                &section,
                "transport",
                if backend.socket().is_local() {
                    "local"
                } else {
                    "tcp"
                },
            );
            ini.set(&section, "protocol", backend.protocol().to_string());
            ini.set(
                &section,
                "health-check-mode",
                backend.monitor().mode().to_string(),
            );
            ini.set(
                &section,
                "health-check-interval",
                backend.monitor().interval().as_secs().to_string(),
            );
            match backend.socket() {
                SocketSpec::Inet { host, port } => {
                    ini.set(&section, "host", host.clone());
                    ini.set(&section, "port", port.to_string());
                }
                SocketSpec::Local { path } => {
                    ini.set(&section, "path", path.display().to_string());
                }
            }
        }

        ini
    }

    pub(crate) fn load_from(&self, path: PathBuf) -> Result<(), ConfigError> {
        if !path.exists() {
            *self.storage_path.lock() = Some(path);
            return self.save_to_storage();
        }

        let ini = IniFile::load(&path)?;
        *self.storage_path.lock() = Some(path);

        // attributes missing from older files fall back to defaults and
        // trigger a rewrite after loading
        let mut changed = 0usize;

        {
            let mut config = self.config.write();

            match ini.get("director", "enabled") {
                Some(value) => config.enabled = parse_bool("director", "enabled", value)?,
                None => changed += 1,
            }

            config.queue_limit =
                parse_number(DIRECTOR, "queue-limit", ini.require(DIRECTOR, "queue-limit")?)?;
            config.queue_timeout =
                parse_seconds(DIRECTOR, "queue-timeout", ini.require(DIRECTOR, "queue-timeout")?)?;
            config.retry_after =
                parse_seconds(DIRECTOR, "retry-after", ini.require(DIRECTOR, "retry-after")?)?;
            config.connect_timeout = parse_seconds(
                DIRECTOR,
                "connect-timeout",
                ini.require(DIRECTOR, "connect-timeout")?,
            )?;
            config.read_timeout =
                parse_seconds(DIRECTOR, "read-timeout", ini.require(DIRECTOR, "read-timeout")?)?;
            config.write_timeout = parse_seconds(
                DIRECTOR,
                "write-timeout",
                ini.require(DIRECTOR, "write-timeout")?,
            )?;
            config.max_retry_count = parse_number(
                DIRECTOR,
                "max-retry-count",
                ini.require(DIRECTOR, "max-retry-count")?,
            )?;
            config.sticky_offline_mode = parse_bool(
                DIRECTOR,
                "sticky-offline-mode",
                ini.require(DIRECTOR, "sticky-offline-mode")?,
            )?;

            match ini.get(DIRECTOR, "on-client-abort") {
                Some(value) => match value.parse() {
                    Ok(action) => config.on_client_abort = action,
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        warn!(value, "invalid on-client-abort; keeping default");
                        changed += 1;
                    }
                },
                None => changed += 1,
            }

            match ini.get(DIRECTOR, "allow-x-sendfile") {
                Some(value) => {
                    config.allow_x_sendfile = parse_bool(DIRECTOR, "allow-x-sendfile", value)?
                }
                None => changed += 1,
            }

            match ini.get(DIRECTOR, "enqueue-on-unavailable") {
                Some(value) => {
                    config.enqueue_on_unavailable =
                        parse_bool(DIRECTOR, "enqueue-on-unavailable", value)?
                }
                None => changed += 1,
            }

            config.health_check.host_header = ini
                .require(DIRECTOR, "health-check-host-header")?
                .to_string();
            config.health_check.request_path = ini
                .require(DIRECTOR, "health-check-request-path")?
                .to_string();
            config.health_check.fcgi_script_filename = ini
                .get(DIRECTOR, "health-check-fcgi-script-filename")
                .unwrap_or_default()
                .to_string();

            match ini.get(DIRECTOR, "scheduler") {
                Some(value) => match value.parse() {
                    Ok(policy) => config.scheduler = policy,
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        warn!(value, "invalid scheduler; keeping default");
                        changed += 1;
                    }
                },
                None => changed += 1,
            }
        }

        let scheduler = self.config.read().scheduler;
        for pool in &self.pools {
            pool.lock().set_policy(scheduler);
        }

        if let Some(cache) = &self.cache {
            match ini.get("cache", "enabled") {
                Some(value) => cache.set_enabled(parse_bool("cache", "enabled", value)?),
                None => changed += 1,
            }
            match ini.get("cache", "deliver-active") {
                Some(value) => {
                    cache.set_deliver_active(parse_bool("cache", "deliver-active", value)?)
                }
                None => changed += 1,
            }
            match ini.get("cache", "deliver-shadow") {
                Some(value) => {
                    cache.set_deliver_shadow(parse_bool("cache", "deliver-shadow", value)?)
                }
                None => changed += 1,
            }
            match ini.get("cache", "default-ttl") {
                Some(value) => {
                    cache.set_default_ttl(parse_seconds("cache", "default-ttl", value)?)
                }
                None => changed += 1,
            }
            match ini.get("cache", "default-shadow-ttl") {
                Some(value) => cache
                    .set_default_shadow_ttl(parse_seconds("cache", "default-shadow-ttl", value)?),
                None => changed += 1,
            }
        }

        let sections: Vec<String> = ini.sections().map(str::to_string).collect();
        for section in sections {
            if section == DIRECTOR || section == "cache" {
                continue;
            }
            if let Some(name) = section.strip_prefix("bucket=") {
                self.load_bucket(&ini, &section, name)?;
            } else if let Some(name) = section.strip_prefix("backend=") {
                self.load_backend(&ini, &section, name)?;
            } else {
                return Err(ConfigError::UnknownSection(section));
            }
        }

        if changed > 0 {
            #[cfg(feature = "tracing")]
            info!(
                cluster = %self.name,
                changed,
                "rewriting configuration; attributes changed while loading"
            );
            self.save_to_storage()?;
        }

        Ok(())
    }

    fn load_bucket(&self, ini: &IniFile, section: &str, name: &str) -> Result<(), ConfigError> {
        let rate = parse_fraction(section, "rate", ini.require(section, "rate")?)?;
        let ceil = parse_fraction(section, "ceil", ini.require(section, "ceil")?)?;

        self.shaper
            .lock()
            .create_node(name, rate, ceil)
            .map_err(|source| ConfigError::Bucket {
                name: name.to_string(),
                source,
            })?;
        Ok(())
    }

    fn load_backend(&self, ini: &IniFile, section: &str, name: &str) -> Result<(), ConfigError> {
        let role_str = ini.require(section, "role")?;
        let role: BackendRole =
            role_str
                .parse()
                .map_err(|_| invalid(section, "role", role_str))?;
        if role == BackendRole::Terminate {
            return Err(invalid(section, "role", role_str));
        }

        let capacity = parse_number(section, "capacity", ini.require(section, "capacity")?)?;
        let protocol_str = ini.require(section, "protocol")?;
        let protocol = protocol_str
            .parse()
            .map_err(|_| invalid(section, "protocol", protocol_str))?;
        let enabled = parse_bool(section, "enabled", ini.require(section, "enabled")?)?;
        let interval = parse_seconds(
            section,
            "health-check-interval",
            ini.require(section, "health-check-interval")?,
        )?;
        let mode_str = ini.require(section, "health-check-mode")?;
        let mode = mode_str
            .parse()
            .map_err(|_| invalid(section, "health-check-mode", mode_str))?;

        let socket = match ini.get(section, "path") {
            Some(path) => SocketSpec::local(path),
            None => {
                let host = ini.require(section, "host")?.to_string();
                let port_str = ini.require(section, "port")?;
                let port: u16 = port_str
                    .parse()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| invalid(section, "port", port_str))?;
                SocketSpec::inet(host, port)
            }
        };

        let spec = BackendSpec {
            name: name.to_string(),
            protocol,
            socket,
            capacity,
            role,
            enabled,
            health_interval: interval,
            health_mode: mode,
        };

        self.create_backend(spec)
            .map_err(|source| ConfigError::Backend {
                name: name.to_string(),
                source,
            })?;
        Ok(())
    }
}

const DIRECTOR: &str = "director";

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn format_fraction(value: f64) -> String {
    format!("{value}")
}

fn invalid(section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(section, key, value)),
    }
}

fn parse_number(section: &str, key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| invalid(section, key, value))
}

fn parse_seconds(section: &str, key: &str, value: &str) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(
        value.parse().map_err(|_| invalid(section, key, value))?,
    ))
}

fn parse_fraction(section: &str, key: &str, value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = value.parse().map_err(|_| invalid(section, key, value))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(invalid(section, key, value));
    }
    Ok(parsed)
}
