// tests/test_store.rs — CSV load/save through the public API.
//
// Run with `cargo test --test test_store`. Everything here is host-only.

use gpufilter::image::Image;
use gpufilter::probe::StatusCode;
use gpufilter::store::{self, CsvError, CsvLimits, RowPolicy};

fn pattern(width: usize, height: usize) -> Image<i32> {
    let data = (0..width * height)
        .map(|i| (i as i32 * 37 - 500) % 1021)
        .collect();
    Image::from_vec(width, height, data)
}

// ===== Round trip =====

#[test]
fn save_then_load_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.csv");
    let img = pattern(17, 9);

    store::save(&path, &img).unwrap();
    let back: Image<i32> = store::load(&path, 17, 9, &CsvLimits::default()).unwrap();
    assert_eq!(back, img);
}

#[test]
fn saved_file_round_trips_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.csv");
    let b = dir.path().join("b.csv");

    store::save(&a, &pattern(5, 4)).unwrap();
    let loaded: Image<i32> = store::load(&a, 5, 4, &CsvLimits::default()).unwrap();
    store::save(&b, &loaded).unwrap();
    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
}

// ===== Output shape =====

#[test]
fn saved_file_has_height_lines_of_width_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shape.csv");
    let (width, height) = (12, 7);
    store::save(&path, &pattern(width, height)).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), height);
    for (y, line) in lines.iter().enumerate() {
        assert_eq!(line.matches(',').count(), width - 1, "row {y}");
    }
    assert!(text.ends_with('\n'));
}

#[test]
fn single_column_has_no_commas() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col.csv");
    store::save(&path, &Image::from_vec(1, 3, vec![4i32, -5, 6])).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "4\n-5\n6\n");
}

// ===== Malformed input =====

#[test]
fn short_rows_are_zero_filled_when_lenient() {
    let img: Image<i32> = store::parse_str("1,2,3\n4\n", 3, 3, &CsvLimits::default()).unwrap();
    assert_eq!(img.as_slice(), &[1, 2, 3, 4, 0, 0, 0, 0, 0]);
}

#[test]
fn short_rows_are_rejected_when_strict() {
    let limits = CsvLimits {
        row_policy: RowPolicy::Strict,
        ..CsvLimits::default()
    };
    let err = store::parse_str::<i32>("1,2,3\n4\n", 3, 2, &limits).unwrap_err();
    assert!(matches!(err, CsvError::Format { line: 2, .. }), "{err}");
    assert_eq!(err.code(), -4);
}

#[test]
fn missing_input_file_is_an_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = store::load::<i32>(dir.path().join("nope.csv"), 2, 2, &CsvLimits::default())
        .unwrap_err();
    assert!(matches!(err, CsvError::Open { .. }));
}

// ===== Output failure =====

#[test]
fn unwritable_destination_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("out.csv");
    let err = store::save(&path, &pattern(3, 3)).unwrap_err();
    assert!(matches!(err, CsvError::Write { .. }), "{err}");
    assert!(!path.exists());
}

#[test]
fn failed_save_keeps_previous_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keep.csv");
    store::save(&path, &pattern(2, 2)).unwrap();
    let before = std::fs::read(&path).unwrap();

    // A directory in place of the destination: persist cannot replace it.
    let blocked = dir.path().join("blocked");
    std::fs::create_dir(&blocked).unwrap();
    assert!(store::save(&blocked, &pattern(2, 2)).is_err());
    assert!(blocked.is_dir());

    assert_eq!(std::fs::read(&path).unwrap(), before);
}
