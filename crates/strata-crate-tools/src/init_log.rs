use std::io::Write;

use anstyle::{AnsiColor, Color, RgbColor, Style};

/// 各个日志级别的配色
struct LogPalette {
    level: Style,
    location: Style,
    message: Style,
}

impl LogPalette {
    fn for_level(default_style: Style, level: log::Level) -> Self {
        let level_color = match level {
            log::Level::Error => Some(Color::Ansi(AnsiColor::Red)),
            log::Level::Warn => Some(Color::Ansi(AnsiColor::Yellow)),
            log::Level::Info => Some(Color::Ansi(AnsiColor::Green)),
            log::Level::Debug | log::Level::Trace => None,
        };
        let level_style = match level_color {
            Some(color) => default_style.fg_color(Some(color)),
            None => default_style,
        };

        Self {
            level: level_style,
            location: Style::new().fg_color(Some(Color::Rgb(RgbColor(110, 110, 110)))),
            // 正文沿用终端默认前景色
            message: Style::new(),
        }
    }
}

/// 默认 Info 级别，`RUST_LOG` 可以覆盖
pub fn init_log() {
    init_log_with_level(log::LevelFilter::Info);
}

/// 重复调用时静默忽略（测试里多个 case 都会初始化日志）
pub fn init_log_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .format(|buf, record| {
            let palette = LogPalette::for_level(buf.default_level_style(record.level()), record.level());
            let level_style = palette.level;
            let location_style = palette.location;
            let message_style = palette.message;

            let line = record.line().unwrap_or(!0);
            // windows 下的路径分隔符也需要处理
            let file = record.file().unwrap_or("").rsplit(['/', '\\']).next().unwrap_or("");
            let time = chrono::Local::now().format("%H:%M:%S%.3f");
            let level = record.level();

            writeln!(
                buf,
                "{level_style}[{time}] {level:<5}{level_style:#} {location_style}[{file}:{line}]{location_style:#} \
                 {message_style}{}{message_style:#}",
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_uses_default_foreground() {
        for level in [log::Level::Error, log::Level::Warn, log::Level::Info, log::Level::Debug] {
            let palette = LogPalette::for_level(Style::new(), level);
            assert_eq!(palette.message.get_fg_color(), None);
            assert_eq!(palette.message, Style::new());
        }
    }

    #[test]
    fn test_level_colors() {
        let error = LogPalette::for_level(Style::new(), log::Level::Error);
        assert_eq!(error.level.get_fg_color(), Some(Color::Ansi(AnsiColor::Red)));

        let debug = LogPalette::for_level(Style::new().bold(), log::Level::Debug);
        assert_eq!(debug.level, Style::new().bold());
    }
}
