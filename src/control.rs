//! Line-oriented control commands read from stdin.

use anyhow::{anyhow, bail, Result};

/// Which apps a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    App(String),
}

impl Target {
    fn parse(word: &str) -> Self {
        if word == "all" {
            Target::All
        } else {
            Target::App(word.to_string())
        }
    }
}

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Restart(Target),
    Clear(Target),
    Heartbeat(Target),
    SaveError { app: String, message: String },
    Status(Option<String>),
    Logs(String),
    Stop(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  restart <app|all>       restart an app
  clear <app|all>         clear an app's logs
  heartbeat <app|all>     mark an app as in use (resumes stopped apps)
  error <app> <message>   record an externally observed error
  status [app]            show status
  logs <app>              print all logs of an app
  stop <app>              shut an app's supervisor down
  help                    show this help
  quit                    stop everything and exit";

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ControlCommand>> {
    let words = shell_words::split(line.trim()).map_err(|err| anyhow!("{}", err))?;
    let Some((verb, rest)) = words.split_first() else {
        return Ok(None);
    };
    let one = |usage: &str| -> Result<String> {
        match rest {
            [arg] => Ok(arg.clone()),
            _ => bail!("usage: {}", usage),
        }
    };
    let command = match verb.as_str() {
        "restart" | "r" => ControlCommand::Restart(Target::parse(&one("restart <app|all>")?)),
        "clear" | "c" => ControlCommand::Clear(Target::parse(&one("clear <app|all>")?)),
        "heartbeat" | "hb" => ControlCommand::Heartbeat(Target::parse(&one("heartbeat <app|all>")?)),
        "error" => match rest {
            [app, message @ ..] if !message.is_empty() => ControlCommand::SaveError {
                app: app.clone(),
                message: message.join(" "),
            },
            _ => bail!("usage: error <app> <message>"),
        },
        "status" | "s" => match rest {
            [] => ControlCommand::Status(None),
            [app] => ControlCommand::Status(Some(app.clone())),
            _ => bail!("usage: status [app]"),
        },
        "logs" | "l" => ControlCommand::Logs(one("logs <app>")?),
        "stop" => ControlCommand::Stop(one("stop <app>")?),
        "help" | "?" => ControlCommand::Help,
        "quit" | "q" | "exit" => ControlCommand::Quit,
        other => bail!("unknown command: {} (try help)", other),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_targets_and_aliases() {
        assert_eq!(
            parse_line("restart blog").unwrap(),
            Some(ControlCommand::Restart(Target::App("blog".to_string())))
        );
        assert_eq!(
            parse_line("hb all").unwrap(),
            Some(ControlCommand::Heartbeat(Target::All))
        );
        assert_eq!(parse_line("status").unwrap(), Some(ControlCommand::Status(None)));
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("q").unwrap(), Some(ControlCommand::Quit));
    }

    #[test]
    fn error_joins_message_words() {
        assert_eq!(
            parse_line("error shop \"GET /\" returned 500").unwrap(),
            Some(ControlCommand::SaveError {
                app: "shop".to_string(),
                message: "GET / returned 500".to_string(),
            })
        );
        assert!(parse_line("error shop").is_err());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_line("restart").is_err());
        assert!(parse_line("logs a b").is_err());
        assert!(parse_line("launch blog").is_err());
        assert!(parse_line("restart \"blog").is_err());
    }
}
