// 📝 Logging - env_logger setup shared by the binary and integration tests

use log::LevelFilter;
use std::io::Write;

/// Install the global logger. `RUST_LOG` still overrides `level` when set.
///
/// HTTP client internals are held at `warn`; at `debug` they drown the
/// pipeline's own lines. Safe to call twice: the second call is a no-op.
pub fn configure_logging(level: &str, json: bool) {
    let env = env_logger::Env::default().default_filter_or(level);
    let mut builder = env_logger::Builder::from_env(env);

    for noisy in ["reqwest", "hyper", "hyper_util", "rustls", "notify"] {
        builder.filter_module(noisy, LevelFilter::Warn);
    }

    if json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "lvl": record.level().to_string(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.target(),
                record.level(),
                record.args()
            )
        });
    }

    let _ = builder.try_init();
}
