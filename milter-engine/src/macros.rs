use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Supplies the current value of a session or envelope macro.
pub trait MacroSource {
    /// Looks up a macro by its bare name (`j`, `daemon_name`).
    fn macro_value(&self, name: &str) -> Option<String>;
}

impl MacroSource for HashMap<String, String> {
    fn macro_value(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl MacroSource for BTreeMap<String, String> {
    fn macro_value(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Ordered name/value pairs sent ahead of one phase.
pub type MacroSet = Vec<(String, String)>;

/// Operator defined values keyed by bare macro name. Their `$x` and
/// `${name}` references are filled in from the session.
pub type MacroTemplates = BTreeMap<String, String>;

/// Macro names configured for each phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MacroNames {
    pub connect: Vec<String>,
    pub helo: Vec<String>,
    pub envfrom: Vec<String>,
    pub envrcpt: Vec<String>,
    pub templates: MacroTemplates,
}

/// Resolves `names`. A name with a template gets the expanded template,
/// any other name the session value as it is. Undefined macros are left
/// out.
pub fn collect(
    names: &[String],
    templates: &MacroTemplates,
    source: &dyn MacroSource,
) -> MacroSet {
    names
        .iter()
        .filter_map(|name| {
            let bare = bare_name(name);
            if bare.is_empty() {
                return None;
            }
            let value = match templates.get(bare) {
                Some(template) => expand(template, source),
                None => source.macro_value(bare)?,
            };
            Some((wire_name(bare), strip_controls(&value)))
        })
        .collect()
}

fn bare_name(name: &str) -> &str {
    let name = name.trim();
    name.strip_prefix('{')
        .and_then(|n| n.strip_suffix('}'))
        .unwrap_or(name)
}

/// Single character names go out as is, longer ones in braces.
fn wire_name(bare: &str) -> String {
    if bare.chars().count() == 1 {
        bare.to_string()
    } else {
        format!("{{{}}}", bare)
    }
}

/// Fills `$x` and `${name}` references in `template`, `$$` being a
/// literal `$`. Inserted values are never expanded again.
pub fn expand(template: &str, source: &dyn MacroSource) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let name = match chars.peek().copied() {
            None => {
                out.push('$');
                break;
            }
            Some('$') => {
                chars.next();
                out.push('$');
                continue;
            }
            Some('{') => {
                let rest: String = chars.clone().skip(1).collect();
                match rest.find('}') {
                    Some(end) => {
                        let name = rest[..end].to_string();
                        // consume "{name}"
                        for _ in 0..name.chars().count() + 2 {
                            chars.next();
                        }
                        name
                    }
                    None => {
                        out.push('$');
                        continue;
                    }
                }
            }
            Some(single) => {
                chars.next();
                single.to_string()
            }
        };

        if let Some(value) = source.macro_value(&name) {
            out.push_str(&value);
        }
    }
    out
}

pub fn strip_controls(value: &str) -> String {
    value.chars().filter(|c| !c.is_ascii_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn source() -> HashMap<String, String> {
        [
            ("j", "mx.example.org"),
            ("daemon_name", "MTA"),
            ("_", "client@[192.0.2.1]"),
            ("price", "$$5"),
            ("auth_authen", "admin"),
            ("dirty", "line\r\nbreak\tand\x7f"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn templates(list: &[(&str, &str)]) -> MacroTemplates {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_collect_names_and_order() {
        let set = collect(
            &names(&["{daemon_name}", "j", "missing", "_"]),
            &MacroTemplates::new(),
            &source(),
        );
        assert_eq!(
            set,
            vec![
                ("{daemon_name}".to_string(), "MTA".to_string()),
                ("j".to_string(), "mx.example.org".to_string()),
                ("_".to_string(), "client@[192.0.2.1]".to_string()),
            ]
        );
    }

    #[test]
    fn test_long_names_are_braced() {
        let set = collect(&names(&["daemon_name"]), &MacroTemplates::new(), &source());
        assert_eq!(set[0].0, "{daemon_name}");
    }

    #[test]
    fn test_template_expanded() {
        let templates = templates(&[("daemon_name", "${daemon_name} on $j"), ("greeting", "hi")]);
        let set = collect(&names(&["daemon_name", "greeting"]), &templates, &source());
        assert_eq!(
            set,
            vec![
                ("{daemon_name}".to_string(), "MTA on mx.example.org".to_string()),
                ("{greeting}".to_string(), "hi".to_string()),
            ]
        );
    }

    #[test]
    fn test_expansion_rules() {
        let src = source();
        assert_eq!(expand("$$", &src), "$");
        assert_eq!(expand("at $j", &src), "at mx.example.org");
        assert_eq!(expand("[${unknown}]", &src), "[]");
        assert_eq!(expand("trailing $", &src), "trailing $");
        assert_eq!(expand("open ${j", &src), "open ${j");
        // inserted values stay literal
        assert_eq!(expand("cost ${price}", &src), "cost $$5");
    }

    #[test]
    fn test_session_values_sent_verbatim() {
        let mut src = source();
        src.insert("s".to_string(), "$s$s$s$s$s$s".to_string());
        src.insert("client_name".to_string(), "evil ${auth_authen}".to_string());

        let started = Instant::now();
        let set = collect(&names(&["s", "client_name"]), &MacroTemplates::new(), &src);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            set,
            vec![
                ("s".to_string(), "$s$s$s$s$s$s".to_string()),
                ("{client_name}".to_string(), "evil ${auth_authen}".to_string()),
            ]
        );
    }

    #[test]
    fn test_template_does_not_reexpand_session_values() {
        let mut src = source();
        src.insert("s".to_string(), "$s$s$s$s$s$s".to_string());
        src.insert("client_name".to_string(), "evil ${auth_authen}".to_string());
        let templates = templates(&[("_", "${client_name} [$s]")]);

        let set = collect(&names(&["_"]), &templates, &src);
        assert_eq!(set[0].1, "evil ${auth_authen} [$s$s$s$s$s$s]");
    }

    #[test]
    fn test_controls_stripped() {
        let set = collect(&names(&["dirty"]), &MacroTemplates::new(), &source());
        assert_eq!(set[0].1, "linebreakand");
    }

    #[test]
    fn test_empty_when_nothing_defined() {
        let set = collect(
            &names(&["a", "{b}"]),
            &MacroTemplates::new(),
            &BTreeMap::<String, String>::new(),
        );
        assert!(set.is_empty());
    }
}
