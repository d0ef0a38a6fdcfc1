use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use crate::cli::OutputFormat;
use crate::job::{ContentPackage, Variant};

/// Render the package in the requested console format.
pub fn render(package: &ContentPackage, format: &OutputFormat) -> Result<String> {
    let content = match format {
        OutputFormat::Markdown => format_as_markdown(package),
        OutputFormat::Json => serde_json::to_string_pretty(package)?,
        OutputFormat::Text => format_as_text(package),
    };
    Ok(content)
}

/// Print the package to the console with styled section headers.
pub fn print_to_console(package: &ContentPackage, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", render(package, format)?),
        _ => {
            for variant in Variant::ALL {
                if let Some(content) = package.variants.get(&variant) {
                    println!("{}", style(format!("── {} ──", variant)).cyan().bold());
                    println!("{}\n", content);
                }
            }
            println!("{}", style("── transcript ──").cyan().bold());
            println!("{}", package.transcript.text);
        }
    }
    Ok(())
}

/// Write each variant plus the transcript into `dir`, returning the paths.
pub fn save_to_dir(package: &ContentPackage, dir: &Path) -> Result<Vec<PathBuf>> {
    fs_err::create_dir_all(dir)?;
    let mut written = Vec::new();

    for variant in Variant::ALL {
        if let Some(content) = package.variants.get(&variant) {
            let path = dir.join(format!("{}.md", variant));
            fs_err::write(&path, content)?;
            written.push(path);
        }
    }

    let transcript_path = dir.join("transcript.txt");
    fs_err::write(&transcript_path, &package.transcript.text)?;
    written.push(transcript_path);

    Ok(written)
}

fn format_as_markdown(package: &ContentPackage) -> String {
    let mut out = String::new();
    let title = package.source.title.as_deref().unwrap_or(&package.source.video_id);
    out.push_str(&format!("# Content package: {}\n\n", title));
    for variant in Variant::ALL {
        if let Some(content) = package.variants.get(&variant) {
            out.push_str(&format!("## {}\n\n{}\n\n", variant, content));
        }
    }
    out.push_str(&format!("## transcript\n\n{}\n", package.transcript.text));
    out
}

fn format_as_text(package: &ContentPackage) -> String {
    let mut out = String::new();
    for variant in Variant::ALL {
        if let Some(content) = package.variants.get(&variant) {
            out.push_str(&format!("=== {} ===\n{}\n\n", variant, content));
        }
    }
    out.push_str(&format!("=== transcript ===\n{}\n", package.transcript.text));
    out
}
