//! File naming conventions for rendered and exported media.

use std::path::{Path, PathBuf};

use crate::shot::MediaKind;

/// Characters that cannot appear in a file name on some platform.
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Subfolder of the project directory holding rendered media of `kind`.
pub fn media_subfolder(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "stills",
        MediaKind::Video => "videos",
    }
}

/// File name of a rendered version.
///
/// Convention: `{shot_name}_{workflow_index}_{version}_{timestamp}{ext}`,
/// with the shot name passed through [`file_stem`]. `ext` includes the
/// leading dot when present.
///
/// # Examples
///
/// ```
/// use shotdesigner_core::naming::version_file_name;
///
/// assert_eq!(
///     version_file_name("Shot 1", 0, 2, 1700000000, ".png"),
///     "Shot_1_0_2_1700000000.png"
/// );
/// ```
pub fn version_file_name(
    shot_name: &str,
    workflow_index: usize,
    version_number: usize,
    timestamp: i64,
    ext: &str,
) -> String {
    let shot = file_stem(shot_name);
    format!("{shot}_{workflow_index}_{version_number}_{timestamp}{ext}")
}

/// `name` made safe for use inside a file name.
///
/// Whitespace, control characters and path or shell-reserved characters
/// become underscores.
pub fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace() || c.is_control() || RESERVED.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// `path` resolved against the working directory when relative.
///
/// Falls back to `path` unchanged if the working directory is unknown.
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Individual export clip name for the shot at position `index`.
pub fn export_clip_name(index: usize) -> String {
    format!("shot_{:03}.mp4", index + 1)
}

/// Name of a merged clip; `tag` disambiguates repeated merges.
pub fn merged_clip_name(tag: u32) -> String {
    format!("merged_video_{tag}.mp4")
}

/// Default name of the shot at 0-based position `index`.
pub fn shot_name(index: usize) -> String {
    format!("Shot {}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_name_replaces_spaces() {
        assert_eq!(
            version_file_name("My big shot", 3, 1, 42, ".mp4"),
            "My_big_shot_3_1_42.mp4"
        );
    }

    #[test]
    fn version_name_strips_path_separators() {
        let name = version_file_name("man/woman walks", 0, 1, 7, ".png");
        assert_eq!(name, "man_woman_walks_0_1_7.png");
        assert_eq!(Path::new(&name).components().count(), 1);
    }

    #[test]
    fn file_stem_replaces_reserved_characters() {
        assert_eq!(file_stem(r#"a\b:c*d?e"f<g>h|i"#), "a_b_c_d_e_f_g_h_i");
        assert_eq!(file_stem("tab\tnew\nline"), "tab_new_line");
        assert_eq!(file_stem("café noir"), "café_noir");
    }

    #[test]
    fn absolute_path_joins_working_directory() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(absolute_path(Path::new("work/p.json")), cwd.join("work/p.json"));
        assert_eq!(absolute_path(&cwd), cwd);
    }

    #[test]
    fn version_name_without_extension() {
        assert_eq!(version_file_name("a", 0, 1, 0, ""), "a_0_1_0");
    }

    #[test]
    fn export_names_are_one_based() {
        assert_eq!(export_clip_name(0), "shot_001.mp4");
        assert_eq!(export_clip_name(41), "shot_042.mp4");
        assert_eq!(export_clip_name(999), "shot_1000.mp4");
    }

    #[test]
    fn subfolders() {
        assert_eq!(media_subfolder(MediaKind::Image), "stills");
        assert_eq!(media_subfolder(MediaKind::Video), "videos");
    }

    #[test]
    fn misc_names() {
        assert_eq!(merged_clip_name(123456), "merged_video_123456.mp4");
        assert_eq!(shot_name(0), "Shot 1");
    }
}
