use std::path::Path;

/// (extension, display name, code fence tag)
const LANGUAGES: &[(&str, &str, &str)] = &[
    ("py", "Python", "python"),
    ("pyw", "Python", "python"),
    ("js", "JavaScript", "javascript"),
    ("jsx", "JavaScript (React)", "jsx"),
    ("ts", "TypeScript", "typescript"),
    ("tsx", "TypeScript (React)", "tsx"),
    ("rs", "Rust", "rust"),
    ("go", "Go", "go"),
    ("java", "Java", "java"),
    ("kt", "Kotlin", "kotlin"),
    ("swift", "Swift", "swift"),
    ("c", "C", "c"),
    ("h", "C Header", "c"),
    ("cpp", "C++", "cpp"),
    ("cc", "C++", "cpp"),
    ("hpp", "C++ Header", "cpp"),
    ("cs", "C#", "csharp"),
    ("rb", "Ruby", "ruby"),
    ("php", "PHP", "php"),
    ("html", "HTML", "html"),
    ("htm", "HTML", "html"),
    ("css", "CSS", "css"),
    ("scss", "SCSS", "scss"),
    ("json", "JSON", "json"),
    ("yaml", "YAML", "yaml"),
    ("yml", "YAML", "yaml"),
    ("toml", "TOML", "toml"),
    ("xml", "XML", "xml"),
    ("md", "Markdown", "markdown"),
    ("sh", "Shell", "bash"),
    ("bash", "Shell", "bash"),
    ("ps1", "PowerShell", "powershell"),
    ("sql", "SQL", "sql"),
    ("lua", "Lua", "lua"),
    ("r", "R", "r"),
    ("dart", "Dart", "dart"),
    ("vue", "Vue", "vue"),
    ("ini", "INI", "ini"),
    ("cfg", "Config", "ini"),
    ("txt", "Text", "text"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub name: &'static str,
    pub fence: &'static str,
}

pub const PLAIN_TEXT: Language = Language {
    name: "Text",
    fence: "text",
};

pub fn detect_language(path: &Path) -> Language {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return PLAIN_TEXT;
    };
    let ext = ext.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(e, _, _)| *e == ext)
        .map(|(_, name, fence)| Language { name, fence })
        .unwrap_or(PLAIN_TEXT)
}

pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            LANGUAGES.iter().any(|(e, _, _)| *e == ext)
        })
        .unwrap_or(false)
}
