//! Launcher option syntax.
//!
//! Options are written `-name` or `/name` and are only recognised before the
//! manifest path. The first token that is not a known option is the manifest;
//! it and everything after it are positional. `normalize` rewrites argv into
//! the `--name[=value]` form clap parses, with `--` in front of the
//! positionals.

use std::ffi::{OsStr, OsString};

struct OptionDef {
    names: &'static [&'static str],
    long: &'static str,
    takes_value: bool,
}

const fn flag(names: &'static [&'static str], long: &'static str) -> OptionDef {
    OptionDef {
        names,
        long,
        takes_value: false,
    }
}

const fn param(names: &'static [&'static str], long: &'static str) -> OptionDef {
    OptionDef {
        names,
        long,
        takes_value: true,
    }
}

const OPTIONS: &[OptionDef] = &[
    flag(&["?", "help"], "help"),
    param(&["d", "debug"], "debug"),
    param(&["t", "timeout"], "timeout"),
    flag(&["test"], "test"),
    flag(&["foreground"], "foreground"),
    param(&["delaylaunch"], "delaylaunch"),
    flag(&["i", "install"], "install"),
    flag(&["u", "uninstall"], "uninstall"),
    param(&["disPrefix"], "disPrefix"),
    param(&["disFile"], "disFile"),
    param(&["appId"], "appId"),
    flag(&["verbose"], "verbose"),
    flag(&["version"], "version"),
];

fn lookup(token: &OsStr) -> Option<&'static OptionDef> {
    let token = token.to_str()?;
    let name = if let Some(rest) = token.strip_prefix('/') {
        rest
    } else if token.starts_with('-') {
        token.trim_start_matches('-')
    } else {
        return None;
    };
    OPTIONS.iter().find(|opt| opt.names.contains(&name))
}

/// Rewrite launcher-style argv (program name first) for clap.
///
/// Fails with the option as typed when an option that takes a parameter is
/// the last token.
pub fn normalize<I>(argv: I) -> Result<Vec<OsString>, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut argv = argv.into_iter();
    let mut out: Vec<OsString> = argv.next().into_iter().collect();

    let mut positionals = Vec::new();
    while let Some(token) = argv.next() {
        if token == "--" {
            break;
        }
        let Some(opt) = lookup(&token) else {
            positionals.push(token);
            break;
        };
        if opt.takes_value {
            let Some(value) = argv.next() else {
                return Err(token.to_string_lossy().into_owned());
            };
            let mut arg = OsString::from(format!("--{}=", opt.long));
            arg.push(&value);
            out.push(arg);
        } else {
            out.push(OsString::from(format!("--{}", opt.long)));
        }
    }

    out.push(OsString::from("--"));
    out.extend(positionals);
    out.extend(argv);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(args: &[&str]) -> Result<Vec<String>, String> {
        let argv = std::iter::once("storelaunch")
            .chain(args.iter().copied())
            .map(OsString::from);
        normalize(argv).map(|v| {
            v.into_iter()
                .skip(1)
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        })
    }

    #[test]
    fn dash_and_slash_options_become_long_flags() {
        assert_eq!(
            norm(&["-test", "/foreground", "-i", "AppxManifest.xml"]).unwrap(),
            ["--test", "--foreground", "--install", "--", "AppxManifest.xml"]
        );
    }

    #[test]
    fn option_parameters_are_attached() {
        assert_eq!(
            norm(&["-t", "5000", "/appId", "App2", "-d", "-p %d", "m.xml"]).unwrap(),
            ["--timeout=5000", "--appId=App2", "--debug=-p %d", "--", "m.xml"]
        );
    }

    #[test]
    fn options_after_the_manifest_are_execution_args() {
        assert_eq!(
            norm(&["-test", "m.xml", "-t", "10", "/verbose"]).unwrap(),
            ["--test", "--", "m.xml", "-t", "10", "/verbose"]
        );
    }

    #[test]
    fn unknown_option_is_taken_as_the_manifest() {
        assert_eq!(
            norm(&["/tmp/run/AppxManifest.xml", "arg"]).unwrap(),
            ["--", "/tmp/run/AppxManifest.xml", "arg"]
        );
        assert_eq!(norm(&["-Test", "m.xml"]).unwrap(), ["--", "-Test", "m.xml"]);
    }

    #[test]
    fn help_spellings() {
        assert_eq!(norm(&["-?"]).unwrap(), ["--help", "--"]);
        assert_eq!(norm(&["/help"]).unwrap(), ["--help", "--"]);
    }

    #[test]
    fn repeated_dis_file() {
        assert_eq!(
            norm(&["-disPrefix", "p", "-disFile", "a.ini", "-disFile", "b.ini", "m.xml"]).unwrap(),
            ["--disPrefix=p", "--disFile=a.ini", "--disFile=b.ini", "--", "m.xml"]
        );
    }

    #[test]
    fn missing_parameter_names_the_option() {
        assert_eq!(norm(&["-test", "-timeout"]), Err("-timeout".to_owned()));
    }

    #[test]
    fn double_dash_ends_options() {
        assert_eq!(norm(&["-u", "--", "-i"]).unwrap(), ["--uninstall", "--", "-i"]);
    }
}
