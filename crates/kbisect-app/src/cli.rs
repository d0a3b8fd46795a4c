use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("kbisect")
        .about("Automated kernel regression bisection across remote test hosts")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file (default: kbisect.toml, or $KBISECT_CONFIG)"),
        )
        .subcommand(
            Command::new("init")
                .about("Create a session: start git bisect, protect kernels, collect baseline")
                .arg(Arg::new("good").required(true).help("Known good ref"))
                .arg(Arg::new("bad").required(true).help("Known bad ref")),
        )
        .subcommand(
            Command::new("start")
                .about("Run the bisection loop; resumes a halted or interrupted session"),
        )
        .subcommand(Command::new("status").about("Read-only session summary"))
        .subcommand(
            Command::new("report")
                .about("Full session report")
                .arg(
                    Arg::new("format")
                        .long("format")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            Command::new("build")
                .about("Build-only mode: compile one ref on all hosts, no boot, no test")
                .arg(Arg::new("ref").required(true).help("Ref to build")),
        )
        .subcommand(Command::new("check").about("Preflight checks: tools, hosts, power, library"))
        .subcommand(
            Command::new("ipmi")
                .about("Power control passthrough for one host")
                .arg(
                    Arg::new("action")
                        .required(true)
                        .value_parser(["status", "on", "off", "reset", "cycle"]),
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("HOSTNAME")
                        .help("Target host (default: first configured host)"),
                ),
        )
        .subcommand(Command::new("kernels").about("List kernels installed on each host"))
        .subcommand(
            Command::new("monitor")
                .about("Watch host liveness")
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Probe once and exit"),
                ),
        )
        .subcommand(
            Command::new("logs")
                .about("Inspect captured build/console/test logs")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List logs for the latest session"))
                .subcommand(
                    Command::new("show")
                        .about("Print one log")
                        .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64))),
                )
                .subcommand(
                    Command::new("export")
                        .about("Write one log to a file")
                        .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64)))
                        .arg(Arg::new("path").required(true)),
                ),
        )
        .subcommand(
            Command::new("metadata")
                .about("Inspect collected host metadata")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List metadata for the latest session"))
                .subcommand(
                    Command::new("show")
                        .about("Print one metadata record")
                        .arg(Arg::new("id").required(true).value_parser(clap::value_parser!(i64))),
                )
                .subcommand(
                    Command::new("export")
                        .about("Write all session metadata to a JSON file")
                        .arg(Arg::new("path").required(true)),
                ),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a commented sample configuration")
                .arg(Arg::new("path").default_value("kbisect.toml")),
        )
}

#[cfg(test)]
mod tests {
    use super::build_cli;

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn init_requires_both_refs() {
        let result = build_cli().try_get_matches_from(["kbisect", "init", "v6.1"]);
        assert!(result.is_err());

        let matches = build_cli()
            .try_get_matches_from(["kbisect", "init", "v6.1", "v6.6"])
            .expect("valid init invocation");
        let (name, sub) = matches.subcommand().expect("subcommand");
        assert_eq!(name, "init");
        assert_eq!(sub.get_one::<String>("good").map(String::as_str), Some("v6.1"));
        assert_eq!(sub.get_one::<String>("bad").map(String::as_str), Some("v6.6"));
    }

    #[test]
    fn report_format_is_validated() {
        assert!(build_cli()
            .try_get_matches_from(["kbisect", "report", "--format", "xml"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["kbisect", "report", "--format", "json"])
            .is_ok());
    }

    #[test]
    fn ipmi_actions_are_validated() {
        assert!(build_cli()
            .try_get_matches_from(["kbisect", "ipmi", "explode"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["kbisect", "ipmi", "cycle", "--host", "h2"])
            .is_ok());
    }
}
