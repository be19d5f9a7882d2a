//! Configuration schema validation and helpers

use std::collections::HashSet;
use std::time::Duration;

use super::Config;
use crate::station::canonical_name;

/// Parse a duration string like "30s", "5m", "1h", "2h30m"
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let mut total_seconds: u64 = 0;
    let mut current_num = String::new();

    for c in s.trim().chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
        } else {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", s))?;
            current_num.clear();

            let unit: u64 = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                _ => return Err(format!("Unknown duration unit: {}", c)),
            };
            total_seconds = num
                .checked_mul(unit)
                .and_then(|secs| total_seconds.checked_add(secs))
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }
    }

    if !current_num.is_empty() {
        return Err(format!("Missing unit in duration: {}", s));
    }

    if total_seconds == 0 {
        return Err(format!("Invalid duration: {}", s));
    }

    Ok(Duration::from_secs(total_seconds))
}

/// Check everything that can be checked before talking to Discord.
///
/// Returns every problem found, one message per problem.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();

    if config.discord.token.trim().is_empty() {
        problems.push("Discord bot token is empty (set DISCORD_BOT_TOKEN)".to_string());
    }
    if config.discord.guild_id.is_none() {
        problems.push("Guild id is not set (set GUILD_ID)".to_string());
    }
    if let Err(e) = config.discord.join_timeout() {
        problems.push(format!("{:#}", e));
    }
    if let Err(e) = config.announce.playback_timeout() {
        problems.push(format!("{:#}", e));
    }
    if config.audio.final_clip.contains(['/', '\\']) {
        problems.push(format!(
            "audio.final_clip must be a file name, got {:?}",
            config.audio.final_clip
        ));
    }

    if config.routes.is_empty() {
        problems.push("No routes configured".to_string());
    }

    let mut seen = HashSet::new();
    for route in &config.routes {
        if canonical_name(&route.id).is_empty() {
            problems.push(format!("Route id {:?} is empty", route.id));
            continue;
        }
        if !seen.insert(canonical_name(&route.id)) {
            problems.push(format!("Route {:?} is defined more than once", route.id));
        }
        if route.stops.is_empty() {
            problems.push(format!("Route {:?} has no stops", route.id));
        }
        if route.stops.iter().any(|s| canonical_name(s).is_empty()) {
            problems.push(format!("Route {:?} has a blank stop name", route.id));
        }
        if route.channel_ref().is_none() && config.discord.voice_channel_id.is_none() {
            problems.push(format!(
                "Route {:?} has no voice channel and VOICE_CHANNEL_ID is not set",
                route.id
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.discord.token = "token".into();
        cfg.discord.guild_id = Some(1);
        cfg.routes.push(RouteConfig {
            id: "Lijn 6".into(),
            channel: Some("lijn 70 (dont delete)".into()),
            channel_id: None,
            stops: vec!["Spawn".into(), "Transferium".into()],
        });
        cfg
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let err = parse_duration("5124095576030432h").unwrap_err();
        assert!(err.contains("too large"), "{}", err);
        assert!(parse_duration("18446744073709551615s1s").is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn missing_credentials_reported() {
        let mut cfg = valid_config();
        cfg.discord.token.clear();
        cfg.discord.guild_id = None;
        let problems = validate(&cfg).unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("DISCORD_BOT_TOKEN"));
        assert!(problems[1].contains("GUILD_ID"));
    }

    #[test]
    fn no_routes_reported() {
        let mut cfg = valid_config();
        cfg.routes.clear();
        let problems = validate(&cfg).unwrap_err();
        assert_eq!(problems, vec!["No routes configured".to_string()]);
    }

    #[test]
    fn route_problems_reported() {
        let mut cfg = valid_config();
        cfg.routes.push(RouteConfig {
            id: "lijn 6".into(),
            channel: None,
            channel_id: None,
            stops: vec![],
        });
        let problems = validate(&cfg).unwrap_err();
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("more than once"));
        assert!(problems[1].contains("no stops"));
        assert!(problems[2].contains("VOICE_CHANNEL_ID"));
    }

    #[test]
    fn default_channel_covers_routes_without_one() {
        let mut cfg = valid_config();
        cfg.discord.voice_channel_id = Some(70);
        cfg.routes[0].channel = None;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn bad_timeout_reported() {
        let mut cfg = valid_config();
        cfg.announce.playback_timeout = "soon".into();
        let problems = validate(&cfg).unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("playback_timeout"));
    }
}
