//! Message formatting: `%(name)s` expansion over a dictionary drawn from
//! host information, the matched class, and per-action substitutions.

use std::collections::BTreeMap;

use crate::hostinfo::HostInfo;
use crate::rules::MatchedRule;

/// Standard messages.
pub const LOG_CONNECT: &str = "accepted: %(connsum)s by %(class)s";
pub const LOG_LIMITS: &str = "refused: %(connsum)s rejected by %(class)s %(limit)s limit";
pub const LOG_REJECT: &str = "rejected: %(connsum)s by %(class)s";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no such substitution key `{0}`")]
    MissingKey(String),
    #[error("malformed substitution in `{0}`")]
    Malformed(String),
}

/// Expands `%(name)s` references against `lookup`; `%%` is a literal
/// percent. Anything else after a `%` is malformed, and a name `lookup`
/// does not know is an error.
pub fn expand(
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(tail) = rest.strip_prefix('%') {
            out.push('%');
            rest = tail;
            continue;
        }
        let Some(inner) = rest.strip_prefix('(') else {
            return Err(TemplateError::Malformed(template.to_owned()));
        };
        let Some(close) = inner.find(')') else {
            return Err(TemplateError::Malformed(template.to_owned()));
        };
        let name = &inner[..close];
        let Some(tail) = inner[close + 1..].strip_prefix('s') else {
            return Err(TemplateError::Malformed(template.to_owned()));
        };
        let value = lookup(name).ok_or_else(|| TemplateError::MissingKey(name.to_owned()))?;
        out.push_str(&value);
        rest = tail;
    }
    out.push_str(rest);

    Ok(out)
}

/// Formats a message with the full dictionary: host information, class
/// data from the matched rule, any extras, and the substitution map. The
/// substitution map cannot override values from elsewhere.
pub fn format(
    template: &str,
    hi: &HostInfo,
    rule: Option<&MatchedRule>,
    sdict: Option<&BTreeMap<String, String>>,
    extras: &[(&str, &str)],
) -> Result<String, TemplateError> {
    let info = hi.info();

    expand(template, |name| {
        if let Some(value) = info.get(name) {
            return Some(value.clone());
        }
        if let Some(rule) = rule {
            match name {
                "class" => return Some(rule.class.clone()),
                "lineno" => return Some(rule.lineno.to_string()),
                "label" => {
                    if let Some(label) = &rule.label {
                        return Some(label.replace('_', " "));
                    }
                }
                _ => {}
            }
        }
        if let Some((_, value)) = extras.iter().find(|(k, _)| *k == name) {
            return Some((*value).to_owned());
        }
        // Some way to insert \r, \n, and \r\n.
        match name {
            "cr" => return Some("\r".to_owned()),
            "nl" => return Some("\n".to_owned()),
            "eol" => return Some("\r\n".to_owned()),
            _ => {}
        }

        sdict.and_then(|d| d.get(name).cloned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::hostinfo_from;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(expand("hello", |_| None), Ok("hello".to_owned()));
        assert_eq!(expand("100%% sure", |_| None), Ok("100% sure".to_owned()));
    }

    #[test]
    fn names_are_looked_up() {
        let result = expand("a %(x)s b", |n| (n == "x").then(|| "X".to_owned()));

        assert_eq!(result, Ok("a X b".to_owned()));
    }

    #[test]
    fn missing_keys_error() {
        assert_eq!(
            expand("%(gone)s", |_| None),
            Err(TemplateError::MissingKey("gone".to_owned()))
        );
    }

    #[test]
    fn malformed_references_error() {
        for bad in ["%", "%x", "%(x", "%(x)d", "%(x)"] {
            assert_eq!(
                expand(bad, |_| Some("v".to_owned())),
                Err(TemplateError::Malformed(bad.to_owned())),
                "case `{bad}`"
            );
        }
    }

    #[test]
    fn host_and_class_keys_compose() {
        let hi = hostinfo_from("10.1.2.3:4000");
        let rule = MatchedRule {
            class: "web".to_owned(),
            lineno: 7,
            label: Some("the_slow_ones".to_owned()),
        };

        let out = format(
            "%(ip)s:%(remport)s by %(class)s@%(lineno)s [%(label)s]%(nl)s",
            &hi,
            Some(&rule),
            None,
            &[],
        )
        .unwrap();
        assert_eq!(out, "10.1.2.3:4000 by web@7 [the slow ones]\n");
    }

    #[test]
    fn extras_and_substitutions_fill_gaps() {
        let hi = hostinfo_from("10.1.2.3:4000");
        let mut sdict = BTreeMap::new();
        sdict.insert("who".to_owned(), "them".to_owned());

        let out = format(
            "%(who)s hit the %(limit)s limit",
            &hi,
            None,
            Some(&sdict),
            &[("limit", "ipmax")],
        )
        .unwrap();
        assert_eq!(out, "them hit the ipmax limit");
    }

    #[test]
    fn substitutions_cannot_shadow_host_keys() {
        let hi = hostinfo_from("10.1.2.3:4000");
        let mut sdict = BTreeMap::new();
        sdict.insert("ip".to_owned(), "not-the-ip".to_owned());

        let out = format("%(ip)s", &hi, None, Some(&sdict), &[]).unwrap();
        assert_eq!(out, "10.1.2.3");
    }

    #[test]
    fn class_keys_require_a_rule() {
        let hi = hostinfo_from("10.1.2.3:4000");

        assert_eq!(
            format("%(class)s", &hi, None, None, &[]),
            Err(TemplateError::MissingKey("class".to_owned()))
        );
    }
}
