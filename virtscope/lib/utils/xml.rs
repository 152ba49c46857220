//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the trimmed text of the first `<tag>...</tag>` element in `xml`.
///
/// This is a plain text scan, good enough for the flat elements hypervisors put at the top of
/// domain and snapshot descriptions (`name`, `uuid`, `creationTime`). Attributes on the opening
/// tag are not supported.
pub fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
