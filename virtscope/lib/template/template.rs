use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{VirtscopeError, VirtscopeResult};

use super::TemplateValues;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An XML document with `$KEY` placeholders.
///
/// A template is immutable once loaded. [`render`](Template::render) produces a new string and
/// leaves the source untouched, so the same template can back any number of domains.
///
/// ## Examples
///
/// ```rust
/// use virtscope::template::{Template, TemplateValues};
///
/// let template = Template::new("<domain><name>$NAME</name><disk>$IMAGE_PATH</disk></domain>");
/// let xml = template.render(&TemplateValues::for_domain("vm1", "/images/a.qcow2"));
///
/// assert_eq!(xml, "<domain><name>vm1</name><disk>/images/a.qcow2</disk></domain>");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// The raw template text.
    source: String,

    /// Where the template was loaded from, if it came from a file.
    path: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Template {
    /// Creates a template from in-memory text.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            path: None,
        }
    }

    /// Reads a template file from disk.
    pub fn load(path: impl AsRef<Path>) -> VirtscopeResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| VirtscopeError::TemplateLoad {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("loaded template {}", path.display());

        Ok(Self {
            source,
            path: Some(path.to_path_buf()),
        })
    }

    /// Returns the raw template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the file the template was loaded from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Substitutes every `$KEY` occurrence with its value.
    ///
    /// Unknown placeholders are copied through verbatim. When several keys match at the same
    /// position the longest one wins, and substituted text is never scanned again.
    pub fn render(&self, values: &TemplateValues) -> String {
        let mut keys: Vec<(&str, &str)> = values.iter().filter(|(k, _)| !k.is_empty()).collect();
        keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut rendered = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(pos) = rest.find('$') {
            rendered.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            match keys.iter().find(|(key, _)| after.starts_with(key)) {
                Some((key, value)) => {
                    rendered.push_str(value);
                    rest = &after[key.len()..];
                }
                None => {
                    rendered.push('$');
                    rest = after;
                }
            }
        }

        rendered.push_str(rest);
        rendered
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use uuid::Uuid;

    use super::*;
    use crate::template::{IMAGE_PATH_KEY, NAME_KEY};

    fn extract<'a>(xml: &'a str, tag: &str) -> &'a str {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = xml.find(&open).unwrap() + open.len();
        let end = xml[start..].find(&close).unwrap() + start;
        &xml[start..end]
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let template = Template::new("$NAME-$UNKNOWN-$NAME");
        let values = TemplateValues::new().with(NAME_KEY, "foo");

        assert_eq!(template.render(&values), "foo-$UNKNOWN-foo");
    }

    #[test]
    fn test_render_prefers_longest_key() {
        let template = Template::new("$NAME $NAME_SUFFIX");
        let values = TemplateValues::new()
            .with(NAME_KEY, "vm")
            .with("NAME_SUFFIX", "tail");

        assert_eq!(template.render(&values), "vm tail");
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let template = Template::new("<name>$NAME</name>");
        let values = TemplateValues::new().with(NAME_KEY, "$IMAGE_PATH");

        assert_eq!(
            template.render(&values.with(IMAGE_PATH_KEY, "/x")),
            "<name>$IMAGE_PATH</name>"
        );
    }

    #[test]
    fn test_render_trailing_dollar() {
        let template = Template::new("cost: 5$");
        assert_eq!(template.render(&TemplateValues::new()), "cost: 5$");
    }

    #[test]
    fn test_render_domain_definition() {
        let template = Template::new(
            "<domain><name>$NAME</name><uuid>$UUID</uuid><disk>$IMAGE_PATH</disk></domain>",
        );

        let first = template.render(&TemplateValues::for_domain("vm1", "/images/a.qcow2"));
        let second = template.render(&TemplateValues::for_domain("vm1", "/images/a.qcow2"));

        assert!(first.contains("<name>vm1</name>"));
        assert!(first.contains("<disk>/images/a.qcow2</disk>"));

        let first_uuid = extract(&first, "uuid");
        let second_uuid = extract(&second, "uuid");
        assert!(Uuid::parse_str(first_uuid).is_ok());
        assert_ne!(first_uuid, second_uuid);

        // The source template is left untouched.
        assert!(template.source().contains("$UUID"));
    }

    #[test]
    fn test_load_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "<domain><name>$NAME</name></domain>")?;

        let template = Template::load(file.path())?;
        assert_eq!(template.path(), Some(file.path()));
        assert_eq!(
            template.render(&TemplateValues::new().with(NAME_KEY, "vm")),
            "<domain><name>vm</name></domain>"
        );

        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        let err = Template::load("/definitely/not/here.xml").unwrap_err();
        assert!(matches!(err, VirtscopeError::TemplateLoad { .. }));
    }
}
