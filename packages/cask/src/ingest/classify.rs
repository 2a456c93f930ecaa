// Mime type and resource type classification
use crate::config::IngestConfig;
use crate::db::ResourceType;
use std::path::Path;

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub mime_type: String,
    pub resource_type: ResourceType,
}

/// Classify a write targeting `target`.
///
/// Mime type precedence: explicit override, reserved linked-data suffix,
/// extension of the target path, extension of the source path. The result
/// is linked data when the suffix matched or the mime type is one of the
/// configured RDF media types.
pub fn classify(
    config: &IngestConfig,
    target: &str,
    mime_override: Option<&str>,
    source_path: Option<&Path>,
) -> Classification {
    let suffix_matched = has_rdf_suffix(config, target);

    let mime_type = mime_override
        .map(str::to_string)
        .or_else(|| suffix_matched.then(|| rdf_mime_for_suffixed(config, target)))
        .or_else(|| guess(Path::new(target)))
        .or_else(|| source_path.and_then(guess))
        .unwrap_or_else(|| FALLBACK_MIME.to_string());

    let resource_type = if suffix_matched || is_rdf_media_type(config, &mime_type) {
        ResourceType::Rdf
    } else {
        ResourceType::File
    };

    Classification {
        mime_type,
        resource_type,
    }
}

fn guess(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first_raw().map(str::to_string)
}

fn filename(target: &str) -> &str {
    target.rsplit('/').next().unwrap_or(target)
}

fn has_rdf_suffix(config: &IngestConfig, target: &str) -> bool {
    let suffix = config.rdf_suffix.to_ascii_lowercase();
    let name = filename(target).to_ascii_lowercase();
    !suffix.is_empty() && name.len() > suffix.len() && name.ends_with(&suffix)
}

fn is_rdf_media_type(config: &IngestConfig, mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    config
        .rdf_media_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(essence))
}

// `data.ttl.rdf` is turtle; a bare `x.rdf` takes whatever the suffix itself
// maps to, then the first configured RDF type.
fn rdf_mime_for_suffixed(config: &IngestConfig, target: &str) -> String {
    let name = filename(target);
    let stem = &name[..name.len() - config.rdf_suffix.len()];
    [guess(Path::new(stem)), guess(Path::new(name))]
        .into_iter()
        .flatten()
        .find(|m| is_rdf_media_type(config, m))
        .or_else(|| config.rdf_media_types.first().cloned())
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}
