//! Installation options: a typed key/value set populated from an ordered chain of sources.
//!
//! Options are named `"<deployment>.<key>"` when they belong to one deployment unit, or carry
//! a bare name when they are global (`system_domain`). Sources run left to right and only write
//! the options they address; an option nobody addressed stays unset (`origin() == None`).

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{KilnError, KilnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    Bool,
    String,
    Int,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::Bool => f.write_str("bool"),
            OptionKind::String => f.write_str("string"),
            OptionKind::Int => f.write_str("int"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    String(String),
    Int(i64),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::String(_) => OptionKind::String,
            OptionValue::Int(_) => OptionKind::Int,
        }
    }

    pub fn zero(kind: OptionKind) -> Self {
        match kind {
            OptionKind::Bool => OptionValue::Bool(false),
            OptionKind::String => OptionValue::String(String::new()),
            OptionKind::Int => OptionValue::Int(0),
        }
    }

    /// Parse a raw flag/prompt string as `kind`.
    pub fn parse(kind: OptionKind, raw: &str) -> KilnResult<Self> {
        let s = raw.trim();
        match kind {
            OptionKind::String => Ok(OptionValue::String(s.to_string())),
            OptionKind::Int => s
                .parse::<i64>()
                .map(OptionValue::Int)
                .map_err(|e| KilnError::validation(format!("'{}' is not an integer: {}", s, e))),
            OptionKind::Bool => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(OptionValue::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(OptionValue::Bool(false)),
                _ => Err(KilnError::validation(format!("'{}' is not a boolean", s))),
            },
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::String(s) => f.write_str(s),
            OptionValue::Int(i) => write!(f, "{}", i),
        }
    }
}

/// Which source last wrote an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionOrigin {
    Flag,
    Interactive,
    Default,
    /// Written by Kiln itself during install (e.g. the discovered system domain).
    Computed,
}

/// How a default is produced for an option nobody set.
#[derive(Clone)]
pub enum DefaultRule {
    Static(OptionValue),
    Computed(Arc<dyn Fn() -> KilnResult<OptionValue> + Send + Sync>),
}

impl fmt::Debug for DefaultRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultRule::Static(v) => f.debug_tuple("Static").field(v).finish(),
            DefaultRule::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallationOption {
    pub name: String,
    pub description: String,
    pub default: Option<DefaultRule>,
    kind: OptionKind,
    value: OptionValue,
    origin: Option<OptionOrigin>,
}

impl InstallationOption {
    pub fn new(name: impl Into<String>, kind: OptionKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
            kind,
            value: OptionValue::zero(kind),
            origin: None,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::String, description)
    }

    pub fn bool(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Bool, description)
    }

    pub fn int(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, OptionKind::Int, description)
    }

    pub fn with_default(mut self, value: impl Into<OptionValue>) -> Self {
        self.default = Some(DefaultRule::Static(value.into()));
        self
    }

    pub fn with_computed_default<F>(mut self, f: F) -> Self
    where
        F: Fn() -> KilnResult<OptionValue> + Send + Sync + 'static,
    {
        self.default = Some(DefaultRule::Computed(Arc::new(f)));
        self
    }

    pub fn kind(&self) -> OptionKind {
        self.kind
    }

    pub fn value(&self) -> &OptionValue {
        &self.value
    }

    pub fn origin(&self) -> Option<OptionOrigin> {
        self.origin
    }

    pub fn is_set(&self) -> bool {
        self.origin.is_some()
    }

    /// Deployment id this option is scoped to, if any.
    pub fn deployment(&self) -> Option<&str> {
        self.name.split_once('.').map(|(d, _)| d)
    }

    /// Overwrite the value. Rejects values whose kind differs from the declared kind.
    pub fn set(&mut self, value: OptionValue, origin: OptionOrigin) -> KilnResult<()> {
        if value.kind() != self.kind {
            return Err(KilnError::validation(format!(
                "option {} expects {} but got {} ({})",
                self.name,
                self.kind,
                value.kind(),
                value
            )));
        }
        self.value = value;
        self.origin = Some(origin);
        Ok(())
    }

    fn static_default(&self) -> Option<&OptionValue> {
        match &self.default {
            Some(DefaultRule::Static(v)) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::String(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::String(v)
    }
}

fn expect_string(opt: &InstallationOption) -> KilnResult<String> {
    match opt.value() {
        OptionValue::String(s) => Ok(s.clone()),
        other => Err(KilnError::validation(format!("option {} is {} not string", opt.name, other.kind()))),
    }
}

fn expect_bool(opt: &InstallationOption) -> KilnResult<bool> {
    match opt.value() {
        OptionValue::Bool(b) => Ok(*b),
        other => Err(KilnError::validation(format!("option {} is {} not bool", opt.name, other.kind()))),
    }
}

fn expect_int(opt: &InstallationOption) -> KilnResult<i64> {
    match opt.value() {
        OptionValue::Int(i) => Ok(*i),
        other => Err(KilnError::validation(format!("option {} is {} not int", opt.name, other.kind()))),
    }
}

/// Ordered option collection with unique names.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    options: Vec<InstallationOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(options: impl IntoIterator<Item = InstallationOption>) -> KilnResult<Self> {
        let mut set = Self::new();
        for opt in options {
            set.insert(opt)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, opt: InstallationOption) -> KilnResult<()> {
        if self.get(&opt.name).is_some() {
            return Err(KilnError::validation(format!("duplicate option {}", opt.name)));
        }
        self.options.push(opt);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstallationOption> {
        self.options.iter()
    }

    pub fn get(&self, name: &str) -> Option<&InstallationOption> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut InstallationOption> {
        self.options.iter_mut().find(|o| o.name == name)
    }

    fn require(&self, name: &str) -> KilnResult<&InstallationOption> {
        self.get(name).ok_or_else(|| KilnError::validation(format!("unknown option {}", name)))
    }

    pub fn set(&mut self, name: &str, value: impl Into<OptionValue>, origin: OptionOrigin) -> KilnResult<()> {
        let opt = self
            .get_mut(name)
            .ok_or_else(|| KilnError::validation(format!("unknown option {}", name)))?;
        opt.set(value.into(), origin)
    }

    pub fn get_string(&self, name: &str) -> KilnResult<String> {
        expect_string(self.require(name)?)
    }

    pub fn get_bool(&self, name: &str) -> KilnResult<bool> {
        expect_bool(self.require(name)?)
    }

    pub fn get_int(&self, name: &str) -> KilnResult<i64> {
        expect_int(self.require(name)?)
    }

    /// Run `sources` left to right. The first failing source aborts the whole populate.
    pub fn populate<'s, I>(self, sources: I) -> KilnResult<Self>
    where
        I: IntoIterator<Item = &'s mut dyn OptionSource>,
    {
        let mut set = self;
        for source in sources {
            debug!(source = source.name(), "populating options");
            set = source.read(set)?;
        }
        Ok(set)
    }

    /// Mutable view over the options named `"<id>.<key>"`. Writes land on the entries of this set.
    pub fn for_deployment(&mut self, id: &str) -> ScopedOptions<'_> {
        let prefix = format!("{}.", id);
        let entries = self.options.iter_mut().filter(|o| o.name.starts_with(&prefix)).collect();
        ScopedOptions { prefix, entries }
    }

    /// `(name, value, origin)` rows for showing the resolved configuration.
    pub fn describe(&self) -> Vec<(String, String, String)> {
        self.options
            .iter()
            .map(|o| {
                let origin = match o.origin {
                    Some(OptionOrigin::Flag) => "flag",
                    Some(OptionOrigin::Interactive) => "interactive",
                    Some(OptionOrigin::Default) => "default",
                    Some(OptionOrigin::Computed) => "computed",
                    None => "unset",
                };
                (o.name.clone(), o.value.to_string(), origin.to_string())
            })
            .collect()
    }
}

/// Projection of an [`OptionSet`] onto one deployment's options.
///
/// Keys may be given with or without the `"<id>."` prefix. The view can overwrite entries but
/// never adds new ones.
#[derive(Debug)]
pub struct ScopedOptions<'a> {
    prefix: String,
    entries: Vec<&'a mut InstallationOption>,
}

impl<'a> ScopedOptions<'a> {
    /// A view with no entries, for units that declare no options.
    pub fn empty(id: &str) -> Self {
        Self { prefix: format!("{}.", id), entries: Vec::new() }
    }

    pub fn deployment(&self) -> &str {
        self.prefix.trim_end_matches('.')
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|o| o.name.as_str()).collect()
    }

    fn full_name(&self, key: &str) -> String {
        if key.starts_with(&self.prefix) {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn get(&self, key: &str) -> Option<&InstallationOption> {
        let full = self.full_name(key);
        self.entries.iter().find(|o| o.name == full).map(|o| &**o)
    }

    fn require(&self, key: &str) -> KilnResult<&InstallationOption> {
        self.get(key)
            .ok_or_else(|| KilnError::validation(format!("unknown option {}", self.full_name(key))))
    }

    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>, origin: OptionOrigin) -> KilnResult<()> {
        let full = self.full_name(key);
        let opt = self
            .entries
            .iter_mut()
            .find(|o| o.name == full)
            .ok_or_else(|| KilnError::validation(format!("unknown option {}", full)))?;
        opt.set(value.into(), origin)
    }

    pub fn get_string(&self, key: &str) -> KilnResult<String> {
        expect_string(self.require(key)?)
    }

    pub fn get_bool(&self, key: &str) -> KilnResult<bool> {
        expect_bool(self.require(key)?)
    }

    pub fn get_int(&self, key: &str) -> KilnResult<i64> {
        expect_int(self.require(key)?)
    }
}

/// One link of the populate chain.
pub trait OptionSource {
    fn name(&self) -> &'static str;

    /// Return `set` with the options this source addresses overwritten.
    fn read(&mut self, set: OptionSet) -> KilnResult<OptionSet>;
}

/// Values passed explicitly on the command line, as raw strings keyed by option name.
#[derive(Debug, Clone, Default)]
pub struct FlagSource {
    values: BTreeMap<String, String>,
}

impl FlagSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, raw: impl Into<String>) -> Self {
        self.values.insert(name.into(), raw.into());
        self
    }

    /// Parse `name=value` assignments as given to `--set`.
    pub fn from_assignments<'a, I>(assignments: I) -> KilnResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Self::new();
        for a in assignments {
            let (name, raw) = a
                .split_once('=')
                .ok_or_else(|| KilnError::validation(format!("expected name=value, got '{}'", a)))?;
            if name.trim().is_empty() {
                return Err(KilnError::validation(format!("empty option name in '{}'", a)));
            }
            out.values.insert(name.trim().to_string(), raw.to_string());
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl OptionSource for FlagSource {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn read(&mut self, mut set: OptionSet) -> KilnResult<OptionSet> {
        for (name, raw) in &self.values {
            let opt = set
                .get_mut(name)
                .ok_or_else(|| KilnError::validation(format!("unknown option {}", name)))?;
            let value = OptionValue::parse(opt.kind(), raw)
                .map_err(|e| KilnError::validation(format!("flag {}: {}", name, e)))?;
            opt.set(value, OptionOrigin::Flag)?;
        }
        Ok(set)
    }
}

/// Prompts for every option still unset. An empty answer leaves the option untouched.
pub struct InteractiveSource<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> InteractiveSource<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> OptionSource for InteractiveSource<R, W> {
    fn name(&self) -> &'static str {
        "interactive"
    }

    fn read(&mut self, mut set: OptionSet) -> KilnResult<OptionSet> {
        for opt in set.options.iter_mut().filter(|o| !o.is_set()) {
            match opt.static_default() {
                Some(d) => write!(self.output, "{} ({}) [{}]: ", opt.description, opt.name, d)?,
                None => write!(self.output, "{} ({}): ", opt.description, opt.name)?,
            }
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                break;
            }
            let answer = line.trim();
            if answer.is_empty() {
                continue;
            }
            let value = OptionValue::parse(opt.kind(), answer)?;
            opt.set(value, OptionOrigin::Interactive)?;
        }
        Ok(set)
    }
}

/// Fills every option still unset from its default rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSource;

impl DefaultSource {
    pub fn new() -> Self {
        Self
    }
}

impl OptionSource for DefaultSource {
    fn name(&self) -> &'static str {
        "defaults"
    }

    fn read(&mut self, mut set: OptionSet) -> KilnResult<OptionSet> {
        for opt in set.options.iter_mut().filter(|o| !o.is_set()) {
            let value = match &opt.default {
                Some(DefaultRule::Static(v)) => v.clone(),
                Some(DefaultRule::Computed(f)) => f()?,
                None => continue,
            };
            opt.set(value, OptionOrigin::Default)?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> OptionSet {
        OptionSet::from_options([
            InstallationOption::string("system_domain", "System domain").with_computed_default(|| Ok("computed.example".into())),
            InstallationOption::string("workloads.builder_image", "Builder image").with_default("builder:full"),
            InstallationOption::bool("workloads.warmup", "Warm up builder").with_default(true),
            InstallationOption::int("registry.node_port", "Registry node port").with_default(30500i64),
            InstallationOption::string("gitea.password", "Gitea password"),
        ])
        .unwrap()
    }

    #[test]
    fn defaults_never_override_flags() {
        let mut flags = FlagSource::new().with("system_domain", "v1");
        let mut defaults = DefaultSource::new();
        let set = sample().populate([&mut flags as &mut dyn OptionSource, &mut defaults]).unwrap();
        assert_eq!(set.get_string("system_domain").unwrap(), "v1");
        assert_eq!(set.get("system_domain").unwrap().origin(), Some(OptionOrigin::Flag));
        // untouched by flags -> default applies
        assert_eq!(set.get_string("workloads.builder_image").unwrap(), "builder:full");
        assert_eq!(set.get_int("registry.node_port").unwrap(), 30500);
        // no default rule -> stays unset
        assert!(!set.get("gitea.password").unwrap().is_set());
    }

    #[test]
    fn scoped_view_filters_and_aliases() {
        let mut set = sample();
        {
            let mut view = set.for_deployment("workloads");
            assert_eq!(view.len(), 2);
            assert!(view.names().iter().all(|n| n.starts_with("workloads.")));
            view.set("builder_image", "custom:1", OptionOrigin::Flag).unwrap();
            view.set("workloads.warmup", false, OptionOrigin::Flag).unwrap();
            // views never create entries
            assert!(view.set("brand_new", "x", OptionOrigin::Flag).is_err());
        }
        assert_eq!(set.get_string("workloads.builder_image").unwrap(), "custom:1");
        assert!(!set.get_bool("workloads.warmup").unwrap());
        assert_eq!(set.len(), 5);
        assert!(set.get("workloads.brand_new").is_none());
    }

    #[test]
    fn prefix_match_requires_dot() {
        let mut set = OptionSet::from_options([
            InstallationOption::string("work.a", "a"),
            InstallationOption::string("workloads.b", "b"),
        ])
        .unwrap();
        assert_eq!(set.for_deployment("work").names(), vec!["work.a"]);
    }

    #[test]
    fn declared_kind_is_enforced() {
        let mut set = sample();
        let err = set.set("registry.node_port", "not-a-number", OptionOrigin::Flag).unwrap_err();
        assert!(matches!(err, KilnError::Validation(_)));
        assert_eq!(set.get_int("registry.node_port").unwrap(), 0);
        assert!(set.get_bool("registry.node_port").is_err());
    }

    #[test]
    fn malformed_flag_aborts_populate() {
        let mut flags = FlagSource::new().with("registry.node_port", "eighty");
        let mut defaults = DefaultSource::new();
        let res = sample().populate([&mut flags as &mut dyn OptionSource, &mut defaults]);
        assert!(matches!(res, Err(KilnError::Validation(_))));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let mut flags = FlagSource::new().with("nope", "1");
        assert!(sample().populate([&mut flags as &mut dyn OptionSource]).is_err());
    }

    #[test]
    fn computed_default_errors_propagate() {
        let set = OptionSet::from_options([
            InstallationOption::string("system_domain", "d").with_computed_default(|| Err(KilnError::remote("no ip"))),
        ])
        .unwrap();
        let mut defaults = DefaultSource::new();
        let err = set.populate([&mut defaults as &mut dyn OptionSource]).unwrap_err();
        assert!(matches!(err, KilnError::Remote(_)));
    }

    #[test]
    fn interactive_prompts_only_unset_options() {
        let mut flags = FlagSource::new().with("system_domain", "given.example");
        // answers: builder image, warmup (blank keeps it), node port, password
        let input = Cursor::new("my/builder:2\n\n31000\nhunter2\n");
        let mut out = Vec::new();
        let set = {
            let mut prompt = InteractiveSource::new(input, &mut out);
            let mut defaults = DefaultSource::new();
            sample()
                .populate([&mut flags as &mut dyn OptionSource, &mut prompt, &mut defaults])
                .unwrap()
        };
        let transcript = String::from_utf8(out).unwrap();
        assert!(!transcript.contains("(system_domain)"), "transcript={}", transcript);
        assert!(transcript.contains("[builder:full]"));
        assert_eq!(set.get_string("workloads.builder_image").unwrap(), "my/builder:2");
        assert!(set.get_bool("workloads.warmup").unwrap());
        assert_eq!(set.get("workloads.warmup").unwrap().origin(), Some(OptionOrigin::Default));
        assert_eq!(set.get_int("registry.node_port").unwrap(), 31000);
        assert_eq!(set.get_string("gitea.password").unwrap(), "hunter2");
    }

    #[test]
    fn assignments_parse() {
        let f = FlagSource::from_assignments(["a.b=1", "c=x=y"]).unwrap();
        assert_eq!(f.values.get("c").map(String::as_str), Some("x=y"));
        assert!(FlagSource::from_assignments(["novalue"]).is_err());
        assert!(FlagSource::from_assignments(["=v"]).is_err());
    }

    #[test]
    fn duplicate_names_rejected() {
        let res = OptionSet::from_options([InstallationOption::bool("x", "x"), InstallationOption::bool("x", "y")]);
        assert!(res.is_err());
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(OptionValue::parse(OptionKind::Bool, "Yes").unwrap(), OptionValue::Bool(true));
        assert_eq!(OptionValue::parse(OptionKind::Bool, "0").unwrap(), OptionValue::Bool(false));
        assert!(OptionValue::parse(OptionKind::Bool, "maybe").is_err());
    }
}
