use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_VERBOSITY: &str = "verbosity";

pub const DEFAULT_PORT: u16 = 3000;

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    // Everything beyond listener and logging comes from the environment; see
    // config::Config for the recognized variables.
    Command::new("authn")
        .about("Authentication service for first-party applications")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value(DEFAULT_PORT.to_string())
                .env("AUTHN_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (-v warn, -vv info, -vvv debug, -vvvv trace)")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_metadata() {
        let command = new();
        assert_eq!(command.get_name(), "authn");
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn port_defaults_and_parses() {
        temp_env::with_vars([("AUTHN_PORT", None::<&str>)], || {
            let matches = new().get_matches_from(vec!["authn"]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(DEFAULT_PORT));

            let matches = new().get_matches_from(vec!["authn", "--port", "8080"]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(8080));
        });
    }

    #[test]
    fn port_reads_the_environment() {
        temp_env::with_vars([("AUTHN_PORT", Some("9000"))], || {
            let matches = new().get_matches_from(vec!["authn"]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(9000));
        });
    }

    #[test]
    fn verbosity_counts_flags() {
        let matches = new().get_matches_from(vec!["authn", "-vvv"]);
        assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(3));

        let matches = new().get_matches_from(vec!["authn"]);
        assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(0));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let result = new().try_get_matches_from(vec!["authn", "--port", "not-a-port"]);
        assert_eq!(
            result.map_err(|err| err.kind()),
            Err(clap::error::ErrorKind::ValueValidation)
        );
    }
}
