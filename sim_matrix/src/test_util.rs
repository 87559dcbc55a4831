use std::fs;
use std::path::PathBuf;

/// Fresh, empty `test_data/<name>` directory.
pub(crate) fn test_dir(name: &str) -> PathBuf {

    let directory = PathBuf::from("test_data").join(name);
    let _ = fs::remove_dir_all(&directory);
    fs::create_dir_all(&directory).unwrap();

    directory
}
