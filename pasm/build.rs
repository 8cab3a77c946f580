use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Builds the fixture test suite.
/// A test is generated for each `.s` file in the `test` subdirectory.
fn main() {
    println!("cargo::rerun-if-changed=test/");

    let out_dir = std::env::var_os("OUT_DIR").unwrap();
    let manifest_dir = std::env::var_os("CARGO_MANIFEST_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("tests.rs");
    let mut file = BufWriter::new(File::create(dest_path).unwrap());

    traverse(&mut file, &PathBuf::from(manifest_dir).join("test"));

    file.flush().unwrap();
}

fn traverse(file: &mut impl std::io::Write, path: &Path) {
    let mut entries = std::fs::read_dir(path)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();
    entries.sort();
    for path in entries {
        let stem = path.file_stem().unwrap().to_string_lossy().replace('-', "_");
        if path.is_dir() {
            writeln!(file, "mod {stem} {{").unwrap();
            traverse(file, &path);
            writeln!(file, "}}").unwrap();
        } else if path.extension().is_some_and(|ext| ext == "s") {
            writeln!(file, "#[test]").unwrap();
            writeln!(file, "fn {stem}() -> Result<(), crate::test::TestError> {{").unwrap();
            writeln!(file, "let src = std::fs::read_to_string({path:?}).map_err(|x| crate::test::TestError::FileError(x.to_string()))?;").unwrap();
            writeln!(file, "crate::test::test({:?}, &src)", path.file_name().unwrap().to_string_lossy()).unwrap();
            writeln!(file, "}}").unwrap();
            writeln!(file).unwrap();
        }
    }
}
