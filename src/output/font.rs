//! TrueType fonts for PDF output.
//!
//! Helvetica only covers WinAnsi, which is no use for Chinese or Japanese
//! books. If a TrueType font is configured, or one turns up in a `fonts`
//! directory next to our executable or in the current directory, PDF pages
//! embed it instead.

use std::{env, fmt};

use ttf_parser::Face;

use crate::prelude::*;

/// Fonts we look for first, in order of preference.
pub const PREFERRED_FONTS: &[&str] = &[
    "msyh.ttf",
    "NotoSansSC-Regular.ttf",
    "NotoSansTC-Regular.ttf",
    "NotoSansJP-Regular.ttf",
    "NotoSansCJKsc-Regular.ttf",
    "SourceHanSansSC-Regular.ttf",
];

/// Name of the directories searched by [`default_font_dirs`].
const FONT_DIR: &str = "fonts";

/// A TrueType font file that we have checked we can parse.
pub struct TrueTypeFont {
    path: PathBuf,
    base_name: String,
    data: Vec<u8>,
}

impl TrueTypeFont {
    /// Read the font at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read font {:?}", path))?;
        Self::from_bytes(path, data)
    }

    /// Wrap font data read from `path`.
    pub fn from_bytes(path: &Path, data: Vec<u8>) -> Result<Self> {
        Face::parse(&data, 0).with_context(|| format!("Failed to parse font {:?}", path))?;
        let base_name = path
            .file_stem()
            .map(|stem| {
                stem.to_string_lossy()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                    .collect::<String>()
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "EmbeddedFont".to_owned());
        Ok(Self {
            path: path.to_owned(),
            base_name,
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The PDF `BaseFont` name, taken from the file name.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// The raw font file.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Parse the font tables. `ttf-parser` reads tables lazily, so this is
    /// cheap enough to do once per document.
    pub fn face(&self) -> Result<Face<'_>> {
        Face::parse(&self.data, 0).with_context(|| format!("Failed to parse font {:?}", self.path))
    }
}

impl fmt::Debug for TrueTypeFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrueTypeFont")
            .field("path", &self.path)
            .field("base_name", &self.base_name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// `fonts` next to our executable, then `fonts` in the current directory.
pub fn default_font_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![];
    if let Ok(exe) = env::current_exe()
        && let Some(exe_dir) = exe.parent()
    {
        dirs.push(exe_dir.join(FONT_DIR));
    }
    dirs.push(PathBuf::from(FONT_DIR));
    dirs
}

/// Look for a font in `dirs`: one of [`PREFERRED_FONTS`] if any directory
/// has one, or else the first `.ttf` file by name.
pub async fn find_font(dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        for name in PREFERRED_FONTS {
            let path = dir.join(name);
            if is_file(&path).await {
                return Some(path);
            }
        }
    }
    for dir in dirs {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            continue;
        };
        let mut fonts = vec![];
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_ttf = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("ttf"));
            if is_ttf && is_file(&path).await {
                fonts.push(path);
            }
        }
        fonts.sort();
        if let Some(font) = fonts.into_iter().next() {
            return Some(font);
        }
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file())
}

/// The font for PDF output: `configured` if set, or else whatever
/// [`find_font`] finds in `dirs`.
///
/// A configured font that won't load is an error. A discovered one is
/// skipped with a warning, and we fall back to Helvetica.
pub async fn resolve_font(
    configured: Option<&Path>,
    dirs: &[PathBuf],
) -> Result<Option<TrueTypeFont>> {
    if let Some(path) = configured {
        return TrueTypeFont::load(path).await.map(Some);
    }
    let Some(path) = find_font(dirs).await else {
        debug!("No TrueType font found, using Helvetica");
        return Ok(None);
    };
    match TrueTypeFont::load(&path).await {
        Ok(font) => Ok(Some(font)),
        Err(err) => {
            warn!("Skipping font {:?}: {:#}", path, err);
            Ok(None)
        }
    }
}

#[cfg(test)]
pub(crate) fn test_font_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fonts/DejaVuSans.ttf")
}
