//! Composes the option bundles of every concern into one command line.
//!
//! Each concern (launcher, logging, bus, a plugin) contributes a clap
//! [`Args`] struct. The binder refuses bundles whose flags collide and keeps
//! every diagnostic scoped to the bundles involved.

use std::{
    any::{TypeId, type_name},
    ffi::OsString,
    fmt,
};

use clap::{
    Args, Command, FromArgMatches,
    error::{ContextKind, ContextValue, ErrorKind},
};
use thiserror::Error;

/// An option bundle that can be bound into the process command line.
///
/// `Default` is required so `--help` can show what an unset bundle resolves
/// to.
pub trait ArgBundle: Args + FromArgMatches + Default + fmt::Debug + 'static {}

impl<T> ArgBundle for T where T: Args + FromArgMatches + Default + fmt::Debug + 'static {}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("{flag} is declared by both {first} and {second}\n\n{usage}")]
    DuplicateFlag {
        flag: String,
        first: &'static str,
        second: &'static str,
        usage: String,
    },

    #[error("{message}\n\n{usage}")]
    Parse {
        message: String,
        usage: String,
        kind: ErrorKind,
    },

    #[error("cannot read {bundle} options: {message}\n\n{usage}")]
    Extract {
        bundle: &'static str,
        message: String,
        usage: String,
    },

    #[error("{0} was never bound")]
    NotBound(&'static str),
}

impl BindError {
    /// `--help` or `--version` output rather than a failure.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            BindError::Parse {
                kind: ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand,
                ..
            }
        )
    }

    pub fn usage(&self) -> Option<&str> {
        match self {
            BindError::DuplicateFlag { usage, .. }
            | BindError::Parse { usage, .. }
            | BindError::Extract { usage, .. } => Some(usage),
            BindError::NotBound(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Flag {
    id: String,
    long: Option<String>,
    short: Option<char>,
}

impl Flag {
    /// The first way `other` collides with this flag, rendered as typed.
    fn collision(&self, other: &Flag) -> Option<String> {
        if let (Some(a), Some(b)) = (&self.long, &other.long) {
            if a == b {
                return Some(format!("--{a}"));
            }
        }
        if let (Some(a), Some(b)) = (self.short, other.short) {
            if a == b {
                return Some(format!("-{a}"));
            }
        }
        (self.id == other.id).then(|| format!("argument id `{}`", self.id))
    }

    fn matches_token(&self, token: &str) -> bool {
        if let Some(long) = token.strip_prefix("--") {
            let long = long.split('=').next().unwrap_or(long);
            return self.long.as_deref() == Some(long);
        }
        if let Some(short) = token.strip_prefix('-') {
            let mut chars = short.chars();
            return chars.next() == self.short && self.short.is_some();
        }
        let bare = token.trim_start_matches('<').trim_end_matches('>');
        self.id.eq_ignore_ascii_case(bare)
    }
}

#[derive(Clone)]
struct BoundBundle {
    type_id: TypeId,
    name: &'static str,
    augment: fn(Command) -> Command,
    defaults: fn() -> String,
    flags: Vec<Flag>,
    /// Id of the argument group clap derives for the bundle struct.
    group: Option<String>,
}

impl BoundBundle {
    fn of<T: ArgBundle>() -> Self {
        let flags = T::augment_args(Command::new("bundle"))
            .get_arguments()
            .map(|arg| Flag {
                id: arg.get_id().to_string(),
                long: arg.get_long().map(str::to_string),
                short: arg.get_short(),
            })
            .collect();
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            augment: T::augment_args,
            defaults: || format!("{:?}", T::default()),
            flags,
            group: T::group_id().map(|id| id.to_string()),
        }
    }

    /// The first name `other` would take over from this bundle, rendered as typed.
    fn collision(&self, other: &BoundBundle) -> Option<String> {
        for theirs in &self.flags {
            for ours in &other.flags {
                if let Some(flag) = theirs.collision(ours) {
                    return Some(flag);
                }
            }
        }
        // clap keeps argument ids and group ids in one namespace
        let group_clash = |group: &Option<String>, flags: &[Flag]| {
            group
                .as_ref()
                .filter(|group| flags.iter().any(|flag| &flag.id == *group))
                .cloned()
        };
        let clash = match (&self.group, &other.group) {
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            _ => group_clash(&self.group, &other.flags)
                .or_else(|| group_clash(&other.group, &self.flags)),
        };
        clash.map(|group| format!("argument group `{group}`"))
    }

    fn owns(&self, token: &str) -> bool {
        self.flags.iter().any(|flag| flag.matches_token(token))
    }
}

fn render_usage(program: &'static str, bundles: &[&BoundBundle]) -> String {
    let mut command = bundles
        .iter()
        .fold(Command::new(program), |command, bundle| (bundle.augment)(command));
    let mut usage = command.render_help().to_string();
    usage.push_str("\nDefaults:\n");
    for bundle in bundles {
        usage.push_str(&format!("  {}: {}\n", bundle.name, (bundle.defaults)()));
    }
    usage
}

/// Help for bundles that cannot share one command, each rendered on its own.
fn render_apart(program: &'static str, bundles: &[&BoundBundle]) -> String {
    bundles
        .iter()
        .map(|bundle| render_usage(program, &[*bundle]))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collects option bundles and parses the process arguments against them.
pub struct ArgsBinder {
    program: &'static str,
    bundles: Vec<BoundBundle>,
}

impl ArgsBinder {
    pub fn new(program: &'static str) -> Self {
        Self {
            program,
            bundles: Vec::new(),
        }
    }

    /// Adds `T` to the command line.
    ///
    /// Binding a bundle that is already bound does nothing. A bundle that
    /// reuses a long flag, short flag, argument id or group id of another
    /// bundle is rejected, naming both bundles.
    pub fn bind<T: ArgBundle>(&mut self) -> Result<(), BindError> {
        if self.is_bound::<T>() {
            return Ok(());
        }
        let candidate = BoundBundle::of::<T>();
        for existing in &self.bundles {
            if let Some(flag) = existing.collision(&candidate) {
                return Err(BindError::DuplicateFlag {
                    flag,
                    first: existing.name,
                    second: candidate.name,
                    usage: render_apart(self.program, &[existing, &candidate]),
                });
            }
        }
        self.bundles.push(candidate);
        Ok(())
    }

    pub fn is_bound<T: ArgBundle>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.bundles.iter().any(|bundle| bundle.type_id == id)
    }

    /// Names of the bound bundles, in binding order.
    pub fn bundle_names(&self) -> Vec<&'static str> {
        self.bundles.iter().map(|bundle| bundle.name).collect()
    }

    pub fn command(&self) -> Command {
        self.bundles
            .iter()
            .fold(Command::new(self.program), |command, bundle| (bundle.augment)(command))
    }

    /// Help for every bound bundle.
    pub fn usage(&self) -> String {
        let all: Vec<&BoundBundle> = self.bundles.iter().collect();
        render_usage(self.program, &all)
    }

    /// Help for `T` alone, or for every bundle when `T` is not bound.
    pub fn usage_of<T: ArgBundle>(&self) -> String {
        let id = TypeId::of::<T>();
        match self.bundles.iter().find(|bundle| bundle.type_id == id) {
            Some(bundle) => render_usage(self.program, &[bundle]),
            None => self.usage(),
        }
    }

    /// One line per bound bundle with the values it has when nothing is passed.
    pub fn defaults(&self) -> String {
        self.bundles
            .iter()
            .map(|bundle| format!("{}: {}", bundle.name, (bundle.defaults)()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parses `argv`, whose first element is the program name.
    pub fn parse_from<I, S>(&self, argv: I) -> Result<ParsedArgs, BindError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString> + Clone,
    {
        let matches = self
            .command()
            .try_get_matches_from(argv)
            .map_err(|err| self.parse_error(err))?;
        Ok(ParsedArgs {
            program: self.program,
            bundles: self.bundles.clone(),
            matches,
        })
    }

    fn parse_error(&self, err: clap::Error) -> BindError {
        let kind = err.kind();
        let rendered = err.to_string();
        if matches!(
            kind,
            ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        ) {
            return BindError::Parse {
                message: rendered,
                usage: format!("Defaults:\n{}", self.defaults()),
                kind,
            };
        }

        let offending = match err.get(ContextKind::InvalidArg) {
            Some(ContextValue::String(arg)) => Some(arg.clone()),
            Some(ContextValue::Strings(args)) => args.first().cloned(),
            _ => None,
        };
        let owners: Vec<&BoundBundle> = offending
            .as_deref()
            .and_then(|arg| arg.split_whitespace().next())
            .map(|token| self.bundles.iter().filter(|b| b.owns(token)).collect())
            .unwrap_or_default();
        let usage = if owners.is_empty() {
            self.usage()
        } else {
            render_usage(self.program, &owners)
        };
        let message = rendered
            .lines()
            .next()
            .unwrap_or_default()
            .trim_start_matches("error: ")
            .to_string();
        BindError::Parse {
            message,
            usage,
            kind,
        }
    }
}

/// Parsed command line, from which each bound bundle can be extracted.
pub struct ParsedArgs {
    program: &'static str,
    bundles: Vec<BoundBundle>,
    matches: clap::ArgMatches,
}

impl ParsedArgs {
    pub fn get<T: ArgBundle>(&self) -> Result<T, BindError> {
        let id = TypeId::of::<T>();
        let Some(bundle) = self.bundles.iter().find(|bundle| bundle.type_id == id) else {
            return Err(BindError::NotBound(type_name::<T>()));
        };
        T::from_arg_matches(&self.matches).map_err(|err| BindError::Extract {
            bundle: bundle.name,
            message: err.to_string().trim_start_matches("error: ").trim().to_string(),
            usage: render_usage(self.program, &[bundle]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Args, Debug, Default, Clone, PartialEq)]
    struct Alpha {
        #[arg(short = 'x', long = "alpha")]
        alpha: Option<String>,
    }

    #[derive(Args, Debug, Default)]
    struct Beta {
        #[arg(short = 'x', long = "beta")]
        beta: Option<String>,
    }

    #[derive(Args, Debug, Default)]
    struct SameLong {
        #[arg(long = "alpha")]
        other: Option<String>,
    }

    #[derive(Args, Debug, Clone, PartialEq)]
    struct Gamma {
        #[arg(long = "count", default_value_t = 3)]
        count: u32,
        #[arg(long = "verbose")]
        verbose: bool,
    }

    impl Default for Gamma {
        fn default() -> Self {
            Self {
                count: 3,
                verbose: false,
            }
        }
    }

    #[test]
    fn duplicate_short_flag_names_both_bundles() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        match binder.bind::<Beta>() {
            Err(BindError::DuplicateFlag {
                flag,
                first,
                second,
                usage,
            }) => {
                assert_eq!(flag, "-x");
                assert_eq!(first, type_name::<Alpha>());
                assert_eq!(second, type_name::<Beta>());
                assert!(usage.contains("--alpha"));
                assert!(usage.contains("--beta"));
            }
            other => panic!("expected duplicate flag, got {other:?}"),
        }
        assert!(!binder.is_bound::<Beta>());
    }

    #[test]
    fn duplicate_long_flag_is_rejected() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        let err = binder.bind::<SameLong>().unwrap_err();
        assert!(matches!(err, BindError::DuplicateFlag { ref flag, .. } if flag == "--alpha"));
        // the rejected bundle never reaches the parser
        let parsed = binder.parse_from(["f4sten", "--alpha", "a"]).unwrap();
        assert_eq!(parsed.get::<Alpha>().unwrap().alpha.as_deref(), Some("a"));
    }

    #[test]
    fn clashing_bundles_get_separate_usage_sections() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        let usage = match binder.bind::<SameLong>() {
            Err(BindError::DuplicateFlag { usage, .. }) => usage,
            other => panic!("expected duplicate flag, got {other:?}"),
        };
        assert_eq!(usage.matches("Usage:").count(), 2, "{usage}");
        assert!(usage.contains(&format!("{}: Alpha {{ alpha: None }}", type_name::<Alpha>())));
        assert!(usage.contains(&format!("{}: SameLong {{ other: None }}", type_name::<SameLong>())));
    }

    mod first {
        #[derive(clap::Args, Debug, Default)]
        pub struct Opts {
            #[arg(long = "foo")]
            pub foo: Option<String>,
        }
    }

    mod second {
        #[derive(clap::Args, Debug, Default)]
        pub struct Opts {
            #[arg(long = "bar")]
            pub bar: Option<String>,
        }
    }

    #[derive(Args, Debug, Default)]
    struct Named {
        // same id as the group derived for `Opts`
        #[arg(id = "Opts", long = "named")]
        named: Option<String>,
    }

    #[test]
    fn bundles_with_the_same_type_name_are_told_apart() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<first::Opts>().unwrap();
        match binder.bind::<second::Opts>() {
            Err(BindError::DuplicateFlag {
                flag,
                first,
                second,
                ..
            }) => {
                assert_eq!(flag, "argument group `Opts`");
                assert!(first.ends_with("first::Opts"), "{first}");
                assert!(second.ends_with("second::Opts"), "{second}");
            }
            other => panic!("expected duplicate group, got {other:?}"),
        }
        let parsed = binder.parse_from(["f4sten", "--foo", "1"]).unwrap();
        assert_eq!(parsed.get::<first::Opts>().unwrap().foo.as_deref(), Some("1"));
    }

    #[test]
    fn argument_id_equal_to_a_group_id_is_rejected() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<first::Opts>().unwrap();
        let err = binder.bind::<Named>().unwrap_err();
        assert!(matches!(err, BindError::DuplicateFlag { ref flag, .. } if flag == "argument group `Opts`"));
    }

    #[test]
    fn binding_the_same_bundle_twice_is_idempotent() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        binder.bind::<Alpha>().unwrap();
        assert_eq!(binder.bundle_names(), vec![type_name::<Alpha>()]);
    }

    #[test]
    fn bound_bundles_are_extracted_after_parsing() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        binder.bind::<Gamma>().unwrap();
        let parsed = binder
            .parse_from(["f4sten", "-x", "one", "--count", "9"])
            .unwrap();
        assert_eq!(parsed.get::<Alpha>().unwrap().alpha.as_deref(), Some("one"));
        assert_eq!(
            parsed.get::<Gamma>().unwrap(),
            Gamma {
                count: 9,
                verbose: false
            }
        );
        assert!(matches!(parsed.get::<Beta>(), Err(BindError::NotBound(name)) if name.ends_with("::Beta")));
    }

    #[test]
    fn bad_value_usage_is_scoped_to_the_owning_bundle() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        binder.bind::<Gamma>().unwrap();
        let err = binder
            .parse_from(["f4sten", "--count", "many"])
            .err()
            .unwrap();
        match err {
            BindError::Parse { message, usage, .. } => {
                assert!(message.contains("many"), "{message}");
                assert!(usage.contains("--count"));
                assert!(!usage.contains("--alpha"));
                assert!(usage.contains("Gamma: Gamma { count: 3, verbose: false }"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_flag_shows_full_usage() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        binder.bind::<Gamma>().unwrap();
        let err = binder.parse_from(["f4sten", "--bogus"]).err().unwrap();
        assert!(!err.is_informational());
        let usage = err.usage().unwrap();
        assert!(usage.contains("--alpha"));
        assert!(usage.contains("--count"));
    }

    #[test]
    fn help_is_informational() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Gamma>().unwrap();
        let err = binder.parse_from(["f4sten", "--help"]).err().unwrap();
        assert!(err.is_informational());
        assert!(err.to_string().contains("--count"));
    }

    #[test]
    fn defaults_render_every_bundle() {
        let mut binder = ArgsBinder::new("f4sten");
        binder.bind::<Alpha>().unwrap();
        binder.bind::<Gamma>().unwrap();
        assert_eq!(
            binder.defaults(),
            format!(
                "{}: Alpha {{ alpha: None }}\n{}: Gamma {{ count: 3, verbose: false }}",
                type_name::<Alpha>(),
                type_name::<Gamma>()
            )
        );
    }
}
