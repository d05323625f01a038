use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use zip::write::SimpleFileOptions;

use crate::core::Hash32;
use crate::framework::Framework;
use crate::metadata::Dependency;

/// Folders inside a package whose framework subfolders contribute assemblies.
const ITEM_GROUPS: [&str; 3] = ["lib", "ref", "build"];

const NUSPEC_NAMESPACE: &str = "http://schemas.microsoft.com/packaging/2013/05/nuspec.xsd";
const CONTENT_TYPES_NAMESPACE: &str = "http://schemas.openxmlformats.org/package/2006/content-types";
const RELATIONSHIPS_NAMESPACE: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const MANIFEST_RELATIONSHIP: &str = "http://schemas.microsoft.com/packaging/2010/07/manifest";

/// Everything written into a package's `.nuspec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub id: String,
    pub version: String,
    pub authors: Vec<String>,
    pub description: String,
    pub project_url: Option<String>,
    pub dependency_groups: Vec<(Framework, Vec<Dependency>)>,
}

type XmlWriter = Writer<Vec<u8>>;

fn xml_document() -> anyhow::Result<XmlWriter> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    Ok(writer)
}

fn finish(writer: XmlWriter) -> anyhow::Result<String> {
    let mut xml = String::from_utf8(writer.into_inner())?;
    xml.push('\n');
    Ok(xml)
}

fn open(writer: &mut XmlWriter, name: &str, attributes: &[(&str, &str)]) -> anyhow::Result<()> {
    let start = BytesStart::new(name).with_attributes(attributes.iter().copied());
    writer.write_event(Event::Start(start))?;
    Ok(())
}

fn close(writer: &mut XmlWriter, name: &str) -> anyhow::Result<()> {
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn empty(writer: &mut XmlWriter, name: &str, attributes: &[(&str, &str)]) -> anyhow::Result<()> {
    let element = BytesStart::new(name).with_attributes(attributes.iter().copied());
    writer.write_event(Event::Empty(element))?;
    Ok(())
}

fn text(writer: &mut XmlWriter, name: &str, content: &str) -> anyhow::Result<()> {
    open(writer, name, &[])?;
    writer.write_event(Event::Text(BytesText::new(content)))?;
    close(writer, name)
}

impl PackageSpec {
    pub fn render_nuspec(&self) -> anyhow::Result<String> {
        let mut xml = xml_document()?;
        open(&mut xml, "package", &[("xmlns", NUSPEC_NAMESPACE)])?;
        open(&mut xml, "metadata", &[])?;
        text(&mut xml, "id", &self.id)?;
        text(&mut xml, "version", &self.version)?;
        text(&mut xml, "authors", &self.authors.join(", "))?;
        text(&mut xml, "description", &self.description)?;
        if let Some(url) = &self.project_url {
            text(&mut xml, "projectUrl", url)?;
        }

        if !self.dependency_groups.is_empty() {
            open(&mut xml, "dependencies", &[])?;
            for (framework, dependencies) in &self.dependency_groups {
                let folder = framework.folder_name();
                let group = [("targetFramework", folder.as_str())];
                if dependencies.is_empty() {
                    empty(&mut xml, "group", &group)?;
                    continue;
                }
                open(&mut xml, "group", &group)?;
                for dependency in dependencies {
                    empty(
                        &mut xml,
                        "dependency",
                        &[("id", dependency.name.as_str()), ("version", dependency.version.as_str())],
                    )?;
                }
                close(&mut xml, "group")?;
            }
            close(&mut xml, "dependencies")?;
        }

        close(&mut xml, "metadata")?;
        close(&mut xml, "package")?;
        finish(xml)
    }
}

/// Every file under `dir`, as paths relative to `dir` with `/` separators,
/// sorted so archives come out the same on every run.
fn files_under(dir: &Utf8Path) -> anyhow::Result<Vec<String>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }

    let pattern = glob::Pattern::escape(dir.as_str()) + "/**/*";
    for entry in glob::glob(&pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if !path.is_file() {
            continue;
        }
        let relative = path
            .strip_prefix(dir)
            .with_context(|| format!("'{path}' is outside '{dir}'"))?;
        files.push(relative.as_str().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

fn content_types<'a>(files: impl IntoIterator<Item = &'a String>) -> anyhow::Result<String> {
    let mut extensions: BTreeSet<String> = ["rels", "nuspec"].map(String::from).into();
    for file in files {
        if let Some((_, ext)) = file.rsplit_once('.') {
            extensions.insert(ext.to_ascii_lowercase());
        }
    }

    let mut xml = xml_document()?;
    open(&mut xml, "Types", &[("xmlns", CONTENT_TYPES_NAMESPACE)])?;
    for ext in &extensions {
        let content_type = match ext.as_str() {
            "rels" => "application/vnd.openxmlformats-package.relationships+xml",
            _ => "application/octet",
        };
        empty(&mut xml, "Default", &[("Extension", ext.as_str()), ("ContentType", content_type)])?;
    }
    close(&mut xml, "Types")?;
    finish(xml)
}

fn relationships(nuspec: &str) -> anyhow::Result<String> {
    let id = format!("R{}", Hash32::hash(nuspec).to_hex()[..16].to_ascii_uppercase());
    let target = format!("/{nuspec}");

    let mut xml = xml_document()?;
    open(&mut xml, "Relationships", &[("xmlns", RELATIONSHIPS_NAMESPACE)])?;
    empty(
        &mut xml,
        "Relationship",
        &[("Type", MANIFEST_RELATIONSHIP), ("Target", target.as_str()), ("Id", id.as_str())],
    )?;
    close(&mut xml, "Relationships")?;
    finish(xml)
}

/// Packs the `ref/` tree under `source_dir` into a `.nupkg` at `output`.
///
/// The archive is written to a partial file first so a failed pack never
/// leaves something that looks like a finished package.
pub fn pack(spec: &PackageSpec, source_dir: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()> {
    let files = files_under(&source_dir.join("ref"))?;
    if files.is_empty() {
        return Err(anyhow!(
            "Package {} has no files under '{source_dir}/ref'",
            spec.id
        ));
    }

    let nuspec_name = format!("{}.nuspec", spec.id);
    let partial = Utf8PathBuf::from(format!("{output}.partial"));
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut writer = zip::ZipWriter::new(
        File::create(&partial).with_context(|| format!("Couldn't create '{partial}'"))?,
    );

    writer.start_file(nuspec_name.as_str(), options)?;
    writer.write_all(spec.render_nuspec()?.as_bytes())?;

    writer.start_file("_rels/.rels", options)?;
    writer.write_all(relationships(&nuspec_name)?.as_bytes())?;

    writer.start_file("[Content_Types].xml", options)?;
    writer.write_all(content_types(&files)?.as_bytes())?;

    for file in &files {
        let bytes = fs::read(source_dir.join("ref").join(file))?;
        writer.start_file(format!("ref/{file}"), options)?;
        writer.write_all(&bytes)?;
    }

    writer.finish()?;
    fs::rename(&partial, output).with_context(|| format!("Couldn't move package to '{output}'"))?;

    tracing::info!("Packed {} {} ({} files)", spec.id, spec.version, files.len());
    Ok(())
}

/// Unpacks a package archive into `dest`.
///
/// Entries are extracted into a sibling temporary directory which is renamed
/// into place at the end, so `dest` either holds the full package or nothing.
pub fn extract_package(bytes: &[u8], dest: &Utf8Path) -> anyhow::Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .context("Couldn't open package archive")?;

    let name = dest.file_name().unwrap_or("package");
    let temp = dest.with_file_name(format!(".{name}.tmp"));
    if temp.exists() {
        fs::remove_dir_all(&temp)?;
    }
    fs::create_dir_all(&temp)?;

    let extracted = (|| -> anyhow::Result<()> {
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let Some(relative) = entry.enclosed_name() else {
                continue;
            };
            let path = temp.as_std_path().join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&path)?;
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            fs::write(&path, &content)?;
        }
        Ok(())
    })();

    if let Err(e) = extracted {
        let _ = fs::remove_dir_all(&temp);
        return Err(e);
    }

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::rename(&temp, dest)?;
    Ok(())
}

fn dlls_in(dir: &Utf8Path) -> anyhow::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_ascii_lowercase().ends_with(".dll") {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Names of the assemblies an unpacked package at `root` provides to a
/// project targeting `framework`.
///
/// Each item group contributes the dlls of its nearest framework folder.
/// A `lib` group without framework folders contributes its own dlls.
pub fn assembly_names_in(root: &Utf8Path, framework: &Framework) -> anyhow::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();

    for group in ITEM_GROUPS {
        let dir = root.join(group);
        if !dir.is_dir() {
            continue;
        }

        let mut folders = BTreeMap::new();
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                folders.insert(entry.file_name().to_string(), entry.into_path());
            }
        }

        let nearest = framework.nearest(folders.keys(), |name| name.parse().ok());
        match nearest {
            Some(folder) => names.extend(dlls_in(&folders[folder])?),
            None if group == "lib" => names.extend(dlls_in(&dir)?),
            None => {}
        }
    }

    Ok(names)
}
