//! Utility functions for reading and modifying the state of sysfs objects.
//!
//! All functions take the containing directory and the attribute name
//! separately so that callers (and tests) can relocate the sysfs root.

use std::{
    fs,
    io::{Error, ErrorKind, Result},
    path::Path,
    str::FromStr,
    string,
};

/// Read and parse a value from an attribute file.
pub fn parse_value<T>(dir: &Path, file: &str) -> Result<T>
where
    T: FromStr,
{
    let path = dir.join(file);
    let s = fs::read_to_string(&path)?;
    let s = s.trim();
    match s.parse() {
        Ok(v) => Ok(v),
        Err(_) => Err(Error::new(
            ErrorKind::InvalidData,
            format!("failed to parse {}: {}", path.display(), s),
        )),
    }
}

/// Read an attribute file as a whitespace-trimmed string. Unlike
/// `parse_value` an empty attribute is not an error here.
pub fn read_trimmed(dir: &Path, file: &str) -> Result<String> {
    let path = dir.join(file);
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Write a value to an attribute file.
pub fn write_value<T>(dir: &Path, file: &str, content: T) -> Result<()>
where
    T: string::ToString,
{
    let path = dir.join(file);
    fs::write(path, content.to_string())
}

/// Check whether an attribute (or sub-object) exists.
pub fn exists(dir: &Path, file: &str) -> bool {
    dir.join(file).exists()
}

/// List the entry names of a sysfs directory. A missing directory yields an
/// empty list since objects come and go while we look at them.
pub fn list_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Ok(Vec::new())
        }
        Err(error) => return Err(error),
    };
    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}
