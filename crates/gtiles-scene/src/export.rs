//! Binary and text glTF export.

use std::fmt;
use std::str::FromStr;

use crate::error::{SceneError, SceneResult};
use crate::glb::GlbDocument;

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// A single `.glb` file.
    #[default]
    Binary,
    /// A `.gltf` JSON file plus a `.bin` sidecar.
    Text,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Binary => "glb",
            ExportFormat::Text => "gltf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = SceneError;

    fn from_str(s: &str) -> SceneResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "glb" | "binary" => Ok(ExportFormat::Binary),
            "gltf" | "text" => Ok(ExportFormat::Text),
            other => Err(SceneError::Unsupported(format!("export format {other}"))),
        }
    }
}

/// Serialized scene, ready to be written out.
#[derive(Debug, Clone)]
pub enum Exported {
    Binary(Vec<u8>),
    Text {
        json: String,
        bin: Vec<u8>,
        /// File name the JSON references for `bin`.
        bin_name: String,
    },
}

/// Serialize `document`. `stem` names the sidecar buffer of text output.
pub fn export(document: &GlbDocument, format: ExportFormat, stem: &str) -> SceneResult<Exported> {
    match format {
        ExportFormat::Binary => document.to_glb_bytes().map(Exported::Binary),
        ExportFormat::Text => {
            let bin_name = format!("{stem}.bin");
            let (json, bin) = document.to_gltf(&bin_name)?;
            Ok(Exported::Text {
                json,
                bin,
                bin_name,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glb::tests::triangle;

    #[test]
    fn test_format_parsing() {
        assert_eq!("GLB".parse::<ExportFormat>().unwrap(), ExportFormat::Binary);
        assert_eq!("gltf".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert!("obj".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::Text.to_string(), "gltf");
    }

    #[test]
    fn test_export_text() {
        let doc = triangle([0.0; 3]);
        let Exported::Text {
            json,
            bin,
            bin_name,
        } = export(&doc, ExportFormat::Text, "scene").unwrap()
        else {
            panic!("expected text export");
        };
        assert_eq!(bin_name, "scene.bin");
        assert!(json.contains("\"uri\": \"scene.bin\""));
        assert_eq!(bin, doc.bin());
    }

    #[test]
    fn test_export_binary() {
        let doc = triangle([0.0; 3]);
        let Exported::Binary(bytes) = export(&doc, ExportFormat::Binary, "scene").unwrap() else {
            panic!("expected binary export");
        };
        assert_eq!(&bytes[..4], b"glTF");
    }
}
