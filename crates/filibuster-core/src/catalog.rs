use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::error;

use filibuster_types::FaultKind;

use crate::error::CatalogError;

/// One metadata value in an exception template.
///
/// Catalog files may write `@expr(metadata['<field>'])`, optionally with a
/// `+ k` or `- k` suffix, to derive the value numerically from the
/// intercepted request's metadata (the canonical use injects a timeout one
/// second under or over the caller's own). Anything else is carried
/// literally.
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataTemplate {
    Literal(Value),
    Expr { field: String, offset: i64 },
}

fn expr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^@expr\(metadata\['([A-Za-z_][A-Za-z0-9_]*)'\](?:\s*([+-])\s*(\d+))?\)$")
            .expect("expression grammar is a valid regex")
    })
}

impl MetadataTemplate {
    /// Parse a raw metadata value. `Err` carries the offending expression
    /// text for the load-time diagnostic.
    fn parse(value: &Value) -> Result<Self, String> {
        let Some(text) = value.as_str() else {
            return Ok(Self::Literal(value.clone()));
        };
        if !text.starts_with("@expr(") {
            return Ok(Self::Literal(value.clone()));
        }

        let Some(captures) = expr_pattern().captures(text) else {
            return Err(text.to_string());
        };

        let field = captures[1].to_string();
        let offset = match (captures.get(2), captures.get(3)) {
            (Some(sign), Some(magnitude)) => {
                let magnitude: i64 = magnitude.as_str().parse().map_err(|_| text.to_string())?;
                if sign.as_str() == "-" { -magnitude } else { magnitude }
            }
            _ => 0,
        };

        Ok(Self::Expr { field, offset })
    }
}

/// An exception the catalog can force at a matching call site.
#[derive(Clone, Debug)]
pub struct ExceptionTemplate {
    pub name: String,
    pub kind: FaultKind,
    /// Metadata key that must be present (and non-null) on the request for
    /// this exception to be schedulable, e.g. `"timeout"`.
    pub restriction: Option<String>,
    pub metadata: Vec<(String, MetadataTemplate)>,
}

impl ExceptionTemplate {
    /// Is this exception applicable to a request with `metadata`?
    pub fn restriction_satisfied(&self, metadata: &Map<String, Value>) -> bool {
        match &self.restriction {
            None => true,
            Some(key) => metadata.get(key).is_some_and(|value| !value.is_null()),
        }
    }

    /// Expand the metadata templates against a request's metadata.
    ///
    /// Returns `None` (and logs) when an expression references a field the
    /// request lacks or that is not numeric; the caller skips the
    /// exception. Catalog-shape problems were already rejected at load.
    pub fn expand_metadata(&self, request_metadata: &Map<String, Value>) -> Option<Map<String, Value>> {
        let mut expanded = Map::new();

        for (key, template) in &self.metadata {
            match template {
                MetadataTemplate::Literal(value) => {
                    expanded.insert(key.clone(), value.clone());
                }
                MetadataTemplate::Expr { field, offset } => {
                    let value = match request_metadata.get(field) {
                        Some(Value::Number(number)) if number.is_i64() || number.is_u64() => {
                            number.as_i64().map(|base| Value::from(base + offset))
                        }
                        Some(Value::Number(number)) => number
                            .as_f64()
                            .map(|base| Value::from(base + *offset as f64)),
                        _ => None,
                    };
                    let Some(value) = value else {
                        error!(
                            exception = %self.name,
                            field = %field,
                            "request metadata missing numeric field for expression; skipping exception"
                        );
                        return None;
                    };
                    expanded.insert(key.clone(), value);
                }
            }
        }

        Some(expanded)
    }
}

/// One `{return_value: ...}` or `{exception: ...}` error shape.
#[derive(Clone, Debug)]
pub struct ErrorType {
    pub kind: FaultKind,
    /// The raw shape, used verbatim as a directive's `failure_metadata`.
    pub body: Value,
}

/// Errors the catalog can inject when a matching service receives a request.
#[derive(Clone, Debug)]
pub struct ErrorTemplate {
    service_pattern: Regex,
    pub types: Vec<ErrorType>,
}

impl ErrorTemplate {
    /// Anchored match of the target service name, like the original matcher.
    pub fn matches_service(&self, service: &str) -> bool {
        self.service_pattern
            .find(service)
            .is_some_and(|m| m.start() == 0)
    }
}

/// One module block of the analysis file, compiled.
#[derive(Clone, Debug)]
pub struct CatalogModule {
    pub id: String,
    pattern: Regex,
    pub exceptions: Vec<ExceptionTemplate>,
    pub errors: Vec<ErrorTemplate>,
}

impl CatalogModule {
    /// Anchored match of `"{module}.{method}"`.
    pub fn matches_callsite(&self, callsite: &str) -> bool {
        self.pattern.find(callsite).is_some_and(|m| m.start() == 0)
    }
}

/// The compiled fault catalog: every call-site pattern and the faults each
/// one admits. Loaded once at startup; immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct FaultCatalog {
    modules: Vec<CatalogModule>,
}

#[derive(Deserialize)]
struct RawModule {
    pattern: String,
    #[serde(default)]
    exceptions: Vec<RawException>,
    #[serde(default)]
    errors: Vec<RawError>,
}

#[derive(Deserialize)]
struct RawException {
    name: String,
    #[serde(default)]
    restrictions: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawError {
    service_name: String,
    #[serde(default)]
    types: Vec<Value>,
}

impl FaultCatalog {
    /// Load and compile an analysis file. Any unreadable file, invalid
    /// regex, or unrecognized expression is fatal.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: BTreeMap<String, RawModule> =
            serde_json::from_str(&contents).map_err(|source| CatalogError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Self::compile(raw)
    }

    /// Compile an already-parsed analysis document (tests and embedders).
    pub fn from_json_value(document: Value) -> Result<Self, CatalogError> {
        let raw: BTreeMap<String, RawModule> =
            serde_json::from_value(document).map_err(|source| CatalogError::Json {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::compile(raw)
    }

    fn compile(raw: BTreeMap<String, RawModule>) -> Result<Self, CatalogError> {
        let mut modules = Vec::with_capacity(raw.len());

        for (id, module) in raw {
            let pattern =
                Regex::new(&module.pattern).map_err(|source| CatalogError::InvalidPattern {
                    module: id.clone(),
                    source,
                })?;

            let mut exceptions = Vec::with_capacity(module.exceptions.len());
            for exception in module.exceptions {
                let mut metadata = Vec::with_capacity(exception.metadata.len());
                for (key, value) in &exception.metadata {
                    let template = MetadataTemplate::parse(value).map_err(|expression| {
                        CatalogError::UnknownExpression {
                            module: id.clone(),
                            name: exception.name.clone(),
                            expression,
                        }
                    })?;
                    metadata.push((key.clone(), template));
                }
                exceptions.push(ExceptionTemplate {
                    kind: FaultKind::of_exception(&exception.name, &exception.metadata),
                    name: exception.name,
                    restriction: exception.restrictions,
                    metadata,
                });
            }

            let mut errors = Vec::with_capacity(module.errors.len());
            for error in module.errors {
                let service_pattern = Regex::new(&error.service_name).map_err(|source| {
                    CatalogError::InvalidServicePattern {
                        module: id.clone(),
                        source,
                    }
                })?;
                let types = error
                    .types
                    .iter()
                    .map(|body| ErrorType {
                        kind: FaultKind::of_error_type(body),
                        body: body.clone(),
                    })
                    .collect();
                errors.push(ErrorTemplate {
                    service_pattern,
                    types,
                });
            }

            modules.push(CatalogModule {
                id,
                pattern,
                exceptions,
                errors,
            });
        }

        Ok(Self { modules })
    }

    /// Modules whose pattern matches `"{module}.{method}"`.
    pub fn matching_modules<'a>(
        &'a self,
        callsite: &'a str,
    ) -> impl Iterator<Item = &'a CatalogModule> {
        self.modules
            .iter()
            .filter(move |module| module.matches_callsite(callsite))
    }

    pub fn modules(&self) -> &[CatalogModule] {
        &self.modules
    }
}
