use crate::engine::EngineSettings;
use crate::filter::{FailurePolicy, FilterDef};
use crate::interpreter::valid_reply_code;
use crate::macros::MacroNames;
use config::{Config, File, FileFormat};
use miette::{bail, Context, IntoDiagnostic, Result};
use milter::{SocketSpec, Timeouts, MAX_CHUNK_SIZE};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub log: CfgLog,
    #[serde(default)]
    pub milter: CfgMilter,
    #[serde(default)]
    pub filter: Vec<CfgFilter>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgLog {
    pub level: String,
    pub format: LogFormat,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgMilter {
    pub chunk_size: usize,
    /// Filters to use, in order. Defaults to every filter in declaration
    /// order.
    pub order: Option<Vec<String>>,
    pub macros: MacroNames,
}

impl Default for CfgMilter {
    fn default() -> Self {
        CfgMilter {
            chunk_size: MAX_CHUNK_SIZE,
            order: None,
            macros: MacroNames::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgFilter {
    pub name: String,
    pub socket: String,
    /// `T` tempfails and `R` rejects when the filter is unavailable.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub timeouts: String,
    pub reply: Option<String>,
}

impl CfgFilter {
    fn to_def(&self) -> Result<FilterDef> {
        let socket = SocketSpec::parse(&self.socket)?;
        let timeouts = Timeouts::parse(&self.timeouts)?;
        let policy = FailurePolicy::from_flags(&self.flags)?;
        if let Some(reply) = &self.reply {
            if !valid_reply_code(reply) {
                bail!("reply {:?} is not a 4xx or 5xx SMTP reply", reply);
            }
        }
        Ok(FilterDef {
            name: self.name.clone(),
            socket,
            timeouts,
            policy,
            reply: self.reply.clone(),
        })
    }
}

impl Cfg {
    /// Loads the file at `cfg_path`. Sticky entries in `options` win over
    /// the file.
    pub fn load(cfg_path: &str, options: &mut MilterOptions) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()
            .wrap_err("reading configuration")?;

        Self::finish(settings, options)
    }

    pub fn from_toml(toml: &str, options: &mut MilterOptions) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .into_diagnostic()?;

        Self::finish(settings, options)
    }

    fn finish(settings: Config, options: &mut MilterOptions) -> Result<Self> {
        let mut cfg: Cfg = settings.try_deserialize().into_diagnostic()?;
        options.merge_file(&cfg)?;
        options.apply(&mut cfg)?;
        Ok(cfg)
    }

    /// Validated filter definitions in the order they will be consulted.
    pub fn filter_defs(&self) -> Result<Vec<Arc<FilterDef>>> {
        let mut seen = HashSet::new();
        let mut defs = Vec::with_capacity(self.filter.len());
        for filter in &self.filter {
            if filter.name.trim().is_empty() {
                bail!("filter without a name");
            }
            if !seen.insert(filter.name.as_str()) {
                bail!("duplicate filter name {}", filter.name);
            }
            let def = filter
                .to_def()
                .wrap_err_with(|| format!("invalid filter {}", filter.name))?;
            defs.push(Arc::new(def));
        }

        match &self.milter.order {
            None => Ok(defs),
            Some(order) => select_filters(&defs, order),
        }
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let chunk_size = self.milter.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            bail!("chunk_size must be between 1 and {}", MAX_CHUNK_SIZE);
        }
        Ok(EngineSettings {
            chunk_size,
            macros: self.milter.macros.clone(),
        })
    }
}

/// Picks `names` out of `defs`, in the order given.
pub fn select_filters(defs: &[Arc<FilterDef>], names: &[String]) -> Result<Vec<Arc<FilterDef>>> {
    let mut selected: Vec<Arc<FilterDef>> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        let def = defs
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| miette::miette!("unknown filter {}", name))?;
        if selected.iter().any(|d| d.name == name) {
            bail!("filter {} listed twice", name);
        }
        selected.push(Arc::clone(def));
    }
    Ok(selected)
}

const OPTION_KEYS: [&str; 6] = [
    "macros.connect",
    "macros.helo",
    "macros.envfrom",
    "macros.envrcpt",
    "chunk_size",
    "log.level",
];

/// Option overrides that remember whether they may be replaced.
///
/// A sticky value (given on the command line) survives later non-sticky
/// settings of the same key (from the configuration file).
#[derive(Debug, Clone, Default)]
pub struct MilterOptions {
    values: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone)]
struct OptionValue {
    value: String,
    sticky: bool,
}

impl MilterOptions {
    /// Returns whether the value was taken.
    pub fn set(&mut self, key: &str, value: &str, sticky: bool) -> Result<bool> {
        if !OPTION_KEYS.contains(&key) {
            bail!("unknown option {}", key);
        }
        if let Some(current) = self.values.get(key) {
            if current.sticky && !sticky {
                return Ok(false);
            }
        }
        self.values.insert(
            key.to_string(),
            OptionValue {
                value: value.to_string(),
                sticky,
            },
        );
        Ok(true)
    }

    /// Sets a `key=value` assignment.
    pub fn set_assignment(&mut self, assignment: &str, sticky: bool) -> Result<bool> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| miette::miette!("expected key=value, got {:?}", assignment))?;
        self.set(key.trim(), value.trim(), sticky)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.value.as_str())
    }

    fn merge_file(&mut self, cfg: &Cfg) -> Result<()> {
        let macros = &cfg.milter.macros;
        self.set("macros.connect", &macros.connect.join(","), false)?;
        self.set("macros.helo", &macros.helo.join(","), false)?;
        self.set("macros.envfrom", &macros.envfrom.join(","), false)?;
        self.set("macros.envrcpt", &macros.envrcpt.join(","), false)?;
        self.set("chunk_size", &cfg.milter.chunk_size.to_string(), false)?;
        self.set("log.level", &cfg.log.level, false)?;
        Ok(())
    }

    fn apply(&self, cfg: &mut Cfg) -> Result<()> {
        for (key, option) in &self.values {
            let value = option.value.as_str();
            match key.as_str() {
                "macros.connect" => cfg.milter.macros.connect = split_list(value),
                "macros.helo" => cfg.milter.macros.helo = split_list(value),
                "macros.envfrom" => cfg.milter.macros.envfrom = split_list(value),
                "macros.envrcpt" => cfg.milter.macros.envrcpt = split_list(value),
                "chunk_size" => {
                    cfg.milter.chunk_size = value
                        .parse()
                        .into_diagnostic()
                        .wrap_err("chunk_size")?
                }
                "log.level" => cfg.log.level = value.to_string(),
                _ => {}
            }
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
