//! Command-line parsing.
//!
//! Hand-rolled (no clap dependency) to keep the binary small and boot
//! fast. One positional argument selects the configuration section;
//! short flags override individual settings.
//!
//! ```text
//! gitup <section> [-cklrV] [-C file] [-d depth] [-h hash] [-t tag]
//!       [-u pack] [-v level] [-w hash]
//! ```

use std::env;

/// Parsed command-line state handed to the configuration loader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: Option<String>,
    pub section: String,
    pub force_clone: bool,
    pub display_depth: Option<u32>,
    pub have: Option<String>,
    pub keep_pack: bool,
    pub low_memory: bool,
    pub repair: bool,
    pub tag: Option<String>,
    pub pack_file: Option<String>,
    pub verbosity: Option<u8>,
    pub want: Option<String>,
}

/// What the command line asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run a sync with the parsed arguments.
    Run(CliArgs),
    /// Print the version and exit.
    Version,
}

/// Parses `std::env::args`.
///
/// Exits the process with code 1 on invalid arguments, printing a
/// diagnostic and the usage summary to stderr.
#[must_use]
pub fn parse_args() -> Command {
    match parse_from(env::args().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("gitup: {message}");
            }
            print_usage(super::config::DEFAULT_CONFIG_PATH);
            std::process::exit(1);
        }
    }
}

/// Parses an argument list; separated out for tests.
///
/// # Errors
/// A human-readable message describing the first invalid argument. An
/// empty message means "no arguments at all" (bare usage display).
pub fn parse_from<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().peekable();
    let mut parsed = CliArgs::default();
    let mut saw_any = false;

    while let Some(arg) = args.next() {
        saw_any = true;
        if !arg.starts_with('-') || arg.len() < 2 {
            if parsed.section.is_empty() {
                parsed.section = arg;
                continue;
            }
            return Err(format!("unexpected argument '{arg}'"));
        }

        let mut cluster = arg[1..].chars();
        while let Some(flag) = cluster.next() {
            // Flags taking a value consume the rest of the cluster or
            // the next argument.
            let mut take_value = |name: char| -> Result<String, String> {
                let rest: String = cluster.by_ref().collect();
                if !rest.is_empty() {
                    return Ok(rest);
                }
                args.next().ok_or_else(|| format!("-{name} requires a value"))
            };

            match flag {
                'C' => parsed.config_path = Some(take_value('C')?),
                'c' => parsed.force_clone = true,
                'd' => {
                    let value = take_value('d')?;
                    parsed.display_depth =
                        Some(value.parse().map_err(|_| format!("bad depth '{value}'"))?);
                }
                'h' => parsed.have = Some(take_value('h')?),
                'k' => parsed.keep_pack = true,
                'l' => parsed.low_memory = true,
                'r' => parsed.repair = true,
                't' => parsed.tag = Some(take_value('t')?),
                'u' => parsed.pack_file = Some(take_value('u')?),
                'v' => {
                    let value = take_value('v')?;
                    parsed.verbosity =
                        Some(value.parse().map_err(|_| format!("bad verbosity '{value}'"))?);
                }
                'V' => return Ok(Command::Version),
                'w' => parsed.want = Some(take_value('w')?),
                other => return Err(format!("unknown option -{other}")),
            }
        }
    }

    if !saw_any || parsed.section.is_empty() {
        return Err(String::new());
    }
    Ok(Command::Run(parsed))
}

/// Prints the usage banner to stderr.
pub fn print_usage(configuration_file: &str) {
    eprintln!(
        "Usage: gitup <section> [-cklrV] [-h checksum] [-t tag] \
         [-u pack file] [-v verbosity] [-w checksum]\n\
         \x20 Please see {configuration_file} for the list of <section> options.\n\n\
         \x20 Options:\n\
         \x20   -C  Override the default configuration file.\n\
         \x20   -c  Force gitup to clone the repository.\n\
         \x20   -d  Limit the display of changes to the specified number of\n\
         \x20         directory levels deep (0 = display the entire path).\n\
         \x20   -h  Override the 'have' checksum.\n\
         \x20   -k  Save a copy of the pack data to the current working directory.\n\
         \x20   -l  Low memory mode -- stores temporary object data to disk.\n\
         \x20   -r  Repair all missing/modified files in the local repository.\n\
         \x20   -t  Fetch the commit referenced by the specified tag.\n\
         \x20   -u  Path to load a copy of the pack data, skipping the download.\n\
         \x20   -v  How verbose the output should be (0 = no output, 1 = the default\n\
         \x20         normal output, 2 = also show debugging information).\n\
         \x20   -V  Display gitup's version number and exit.\n\
         \x20   -w  Override the 'want' checksum.\n"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        parse_from(args.iter().map(ToString::to_string))
    }

    fn run(args: &[&str]) -> CliArgs {
        match parse(args).unwrap() {
            Command::Run(parsed) => parsed,
            Command::Version => panic!("unexpected version command"),
        }
    }

    #[test]
    fn section_with_flags() {
        let parsed = run(&["src", "-c", "-v", "2", "-d3"]);
        assert_eq!(parsed.section, "src");
        assert!(parsed.force_clone);
        assert_eq!(parsed.verbosity, Some(2));
        assert_eq!(parsed.display_depth, Some(3));
    }

    #[test]
    fn clustered_boolean_flags() {
        let parsed = run(&["-klr", "ports"]);
        assert!(parsed.keep_pack);
        assert!(parsed.low_memory);
        assert!(parsed.repair);
        assert_eq!(parsed.section, "ports");
    }

    #[test]
    fn value_flags_attached_and_detached() {
        let want = "1234567890123456789012345678901234567890";
        let parsed = run(&["src", &format!("-w{want}"), "-t", "v1.0"]);
        assert_eq!(parsed.want.as_deref(), Some(want));
        assert_eq!(parsed.tag.as_deref(), Some("v1.0"));
    }

    #[test]
    fn version_flag_wins() {
        assert!(matches!(parse(&["src", "-V"]), Ok(Command::Version)));
    }

    #[test]
    fn missing_section_is_usage() {
        assert_eq!(parse(&["-c"]), Err(String::new()));
        assert_eq!(parse(&[]), Err(String::new()));
    }

    #[test]
    fn missing_value_is_diagnosed() {
        let err = parse(&["src", "-w"]).unwrap_err();
        assert!(err.contains("-w"));
    }
}
