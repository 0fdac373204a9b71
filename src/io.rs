//! File I/O for configurations, trajectories and run diagnostics.
//!
//! Structures and trajectories use the extended XYZ layout: an atom-count
//! line, a comment line of `key=value` pairs, then one `El x y z` line per
//! atom. The comment line carries everything a [`Configuration`] needs beyond
//! positions:
//!
//! ```text
//! 3
//! Lattice="10 0 0 0 10 0 0 0 10" pbc="T T T" energy=-1.25 fixed="0,2"
//! H 0 0 0
//! H 0.5 0.5 0.5
//! H 2.5 2.5 2.5
//! ```
//!
//! Multi-frame files are plain concatenations, which is what the full NEB
//! trajectory is. Coordinates are written with Rust's shortest round-trip
//! float formatting, so a frame read back is bit-identical to the one written.

use crate::geometry::Configuration;
use crate::neb::ConvergenceRecord;
use crate::path::ImageChain;
use lazy_static::lazy_static;
use log::debug;
use nalgebra::Matrix3;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading structure or trajectory files.
#[derive(Error, Debug)]
pub enum StructureError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed content
    #[error("{path}:{line}: {message}")]
    Parse {
        /// File being read
        path: PathBuf,
        /// One-based line number
        line: usize,
        /// What went wrong
        message: String,
    },
}

/// Result type for structure I/O
pub type Result<T> = std::result::Result<T, StructureError>;

lazy_static! {
    static ref COMMENT_PAIR_RE: Regex =
        Regex::new(r#"(\w+)=(?:"([^"]*)"|(\S+))"#).expect("valid comment regex");
}

/// One frame of a structure or trajectory file.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The configuration, including cell and fixed atoms
    pub config: Configuration,
    /// Potential energy stored with the frame, if any
    pub energy: Option<f64>,
}

/// Frames read from a trajectory together with tail diagnostics.
#[derive(Debug, Clone)]
pub struct TrajectoryRead {
    /// Complete frames in file order
    pub frames: Vec<Frame>,
    /// True when the file ended inside a frame (interrupted write)
    pub partial_tail: bool,
}

/// Renders one configuration as an extended XYZ frame.
pub fn format_extxyz(config: &Configuration, energy: Option<f64>) -> String {
    let c = &config.cell;
    let flag = |p: bool| if p { "T" } else { "F" };
    let mut content = format!(
        "{}\nLattice=\"{} {} {} {} {} {} {} {} {}\" pbc=\"{} {} {}\"",
        config.num_atoms,
        c[(0, 0)],
        c[(0, 1)],
        c[(0, 2)],
        c[(1, 0)],
        c[(1, 1)],
        c[(1, 2)],
        c[(2, 0)],
        c[(2, 1)],
        c[(2, 2)],
        flag(config.pbc[0]),
        flag(config.pbc[1]),
        flag(config.pbc[2]),
    );
    if let Some(e) = energy {
        content.push_str(&format!(" energy={}", e));
    }
    if !config.fixed().is_empty() {
        let fixed: Vec<String> = config.fixed().iter().map(|i| i.to_string()).collect();
        content.push_str(&format!(" fixed=\"{}\"", fixed.join(",")));
    }
    content.push('\n');

    for atom in 0..config.num_atoms {
        let p = config.atom_position(atom);
        content.push_str(&format!(
            "{} {} {} {}\n",
            config.elements[atom], p.x, p.y, p.z
        ));
    }
    content
}

/// Writes a single configuration, replacing the file.
pub fn write_extxyz(path: &Path, config: &Configuration, energy: Option<f64>) -> std::io::Result<()> {
    fs::write(path, format_extxyz(config, energy))
}

/// Appends a block of frames to a trajectory in one write.
pub fn append_frames(path: &Path, frames: &[(&Configuration, Option<f64>)]) -> std::io::Result<()> {
    let block: String = frames
        .iter()
        .map(|(config, energy)| format_extxyz(config, *energy))
        .collect();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(block.as_bytes())?;
    file.sync_data()
}

/// Reads the last frame of a structure file.
///
/// Hand-written structure files often lack a final newline, so unlike
/// [`read_extxyz_frames`] an unterminated last line is accepted here.
pub fn read_extxyz(path: &Path) -> Result<Frame> {
    let read = parse_frames(path, false)?;
    read.frames.into_iter().last().ok_or_else(|| StructureError::Parse {
        path: path.to_path_buf(),
        line: 1,
        message: "no complete frame found".to_string(),
    })
}

/// Reads every complete frame of a trajectory.
///
/// A trailing frame cut short by an interrupted write is dropped and reported
/// through [`TrajectoryRead::partial_tail`] instead of failing the read.
/// Every block written by [`append_frames`] ends in a newline, so a file
/// whose last line is unterminated was cut mid-write even when that line
/// still parses.
pub fn read_extxyz_frames(path: &Path) -> Result<TrajectoryRead> {
    parse_frames(path, true)
}

fn parse_frames(path: &Path, require_terminated: bool) -> Result<TrajectoryRead> {
    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let last_line_cut = require_terminated && !content.is_empty() && !content.ends_with('\n');
    let parse_err = |line: usize, message: String| StructureError::Parse {
        path: path.to_path_buf(),
        line: line + 1,
        message,
    };

    let mut frames = Vec::new();
    let mut partial_tail = false;
    let mut cursor = 0;
    while cursor < lines.len() {
        let header = lines[cursor].trim();
        if header.is_empty() {
            cursor += 1;
            continue;
        }
        let num_atoms: usize = match header.parse() {
            Ok(n) => n,
            Err(_) if cursor + 1 >= lines.len() => {
                partial_tail = true;
                break;
            }
            Err(_) => return Err(parse_err(cursor, format!("expected atom count, found '{}'", header))),
        };
        if cursor + 2 + num_atoms > lines.len() || (last_line_cut && cursor + 2 + num_atoms == lines.len()) {
            partial_tail = true;
            break;
        }

        let (cell, pbc, energy, fixed) = parse_comment(lines[cursor + 1])
            .map_err(|message| parse_err(cursor + 1, message))?;

        let mut elements = Vec::with_capacity(num_atoms);
        let mut coords = Vec::with_capacity(num_atoms * 3);
        let mut truncated = false;
        for offset in 0..num_atoms {
            let line_no = cursor + 2 + offset;
            let fields: Vec<&str> = lines[line_no].split_whitespace().collect();
            if fields.len() < 4 {
                // only the very last line of the file may be cut short
                if line_no + 1 == lines.len() {
                    truncated = true;
                    break;
                }
                return Err(parse_err(line_no, "expected 'El x y z'".to_string()));
            }
            elements.push(fields[0].to_string());
            for field in &fields[1..4] {
                let value: f64 = field
                    .parse()
                    .map_err(|_| parse_err(line_no, format!("invalid coordinate '{}'", field)))?;
                coords.push(value);
            }
        }
        if truncated {
            partial_tail = true;
            break;
        }

        let mut config = Configuration::new(elements, coords).with_cell(cell, pbc);
        config
            .fix_atoms(&fixed)
            .map_err(|e| parse_err(cursor + 1, e.to_string()))?;
        frames.push(Frame { config, energy });
        cursor += 2 + num_atoms;
    }

    if partial_tail {
        debug!("{}: dropped incomplete trailing frame", path.display());
    }
    Ok(TrajectoryRead {
        frames,
        partial_tail,
    })
}

type CommentFields = (Matrix3<f64>, [bool; 3], Option<f64>, Vec<usize>);

fn parse_comment(line: &str) -> std::result::Result<CommentFields, String> {
    let mut cell = Matrix3::zeros();
    let mut pbc = [false; 3];
    let mut energy = None;
    let mut fixed = Vec::new();
    let mut has_lattice = false;
    let mut has_pbc = false;

    for caps in COMMENT_PAIR_RE.captures_iter(line) {
        let key = caps[1].to_ascii_lowercase();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or("");
        match key.as_str() {
            "lattice" => {
                let values: Vec<f64> = value
                    .split_whitespace()
                    .map(|v| v.parse::<f64>().map_err(|_| format!("invalid Lattice value '{}'", v)))
                    .collect::<std::result::Result<_, _>>()?;
                if values.len() != 9 {
                    return Err(format!("Lattice needs 9 values, found {}", values.len()));
                }
                cell = Matrix3::from_row_slice(&values);
                has_lattice = true;
            }
            "pbc" => {
                for (k, flag) in value.split_whitespace().take(3).enumerate() {
                    pbc[k] = matches!(flag, "T" | "t" | "True" | "true" | "1");
                }
                has_pbc = true;
            }
            "energy" => {
                energy = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid energy '{}'", value))?,
                );
            }
            "fixed" => {
                fixed = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<usize>().map_err(|_| format!("invalid fixed index '{}'", s)))
                    .collect::<std::result::Result<_, _>>()?;
            }
            _ => {}
        }
    }

    if has_lattice && !has_pbc {
        pbc = [true; 3];
    }
    Ok((cell, pbc, energy, fixed))
}

/// Running convergence log: a human-readable text log and a CSV table.
pub struct ConvergenceLog {
    log_path: PathBuf,
    csv_path: PathBuf,
}

impl ConvergenceLog {
    /// Starts both files, writing their headers unless `append` is set and the
    /// files already exist.
    pub fn open(log_path: &Path, csv_path: &Path, append: bool) -> std::io::Result<Self> {
        if !(append && log_path.exists()) {
            fs::write(
                log_path,
                format!("{:>6} {:>19} {:>16} {:>6}\n", "step", "fmax(eV/A)", "barrier(eV)", "imax"),
            )?;
        }
        if !(append && csv_path.exists()) {
            fs::write(csv_path, "step,max_band_force,barrier_height\n")?;
        }
        Ok(Self {
            log_path: log_path.to_path_buf(),
            csv_path: csv_path.to_path_buf(),
        })
    }

    /// Appends one row to both files.
    pub fn append(&self, record: &ConvergenceRecord) -> std::io::Result<()> {
        let mut log = OpenOptions::new().append(true).open(&self.log_path)?;
        writeln!(
            log,
            "{:>6} {:>19.6} {:>16.6} {:>6}",
            record.step, record.max_band_force, record.barrier_height, record.max_energy_index
        )?;
        let mut csv = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(
            csv,
            "{},{},{}",
            record.step, record.max_band_force, record.barrier_height
        )
    }
}

/// Exports each image as `NN.xyz` inside `dir`.
pub fn write_image_folder(dir: &Path, chain: &ImageChain) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    for (i, image) in chain.images().enumerate() {
        write_extxyz(&dir.join(format!("{:02}.xyz", i)), image, chain.energy(i))?;
    }
    Ok(())
}

/// Writes the energy profile (`image,energy,rel_energy`) and returns the
/// forward and reverse barriers when every energy is known.
pub fn write_energy_profile(path: &Path, chain: &ImageChain) -> std::io::Result<Option<(f64, f64)>> {
    let mut file = File::create(path)?;
    writeln!(file, "image,energy,rel_energy")?;
    let energies: Vec<Option<f64>> = (0..chain.len()).map(|i| chain.energy(i)).collect();
    let min = energies
        .iter()
        .flatten()
        .copied()
        .fold(f64::INFINITY, f64::min);
    for (i, energy) in energies.iter().enumerate() {
        match energy {
            Some(e) => writeln!(file, "{},{},{}", i, e, e - min)?,
            None => writeln!(file, "{},,", i)?,
        }
    }
    Ok(chain.barriers())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Configuration {
        let mut config = Configuration::new(
            vec!["H".to_string(), "O".to_string(), "H".to_string()],
            vec![0.1, 0.2, 0.3, 1.0 / 3.0, 2.0, 3.0, -4.5, 5.25, 6.0],
        )
        .with_cell(Matrix3::from_diagonal_element(12.5), [true, true, false]);
        config.fix_atoms(&[0, 2]).unwrap();
        config
    }

    #[test]
    fn test_frame_written_and_read_back_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("one.xyz");
        let config = sample();
        write_extxyz(&path, &config, Some(-1.0 / 7.0)).unwrap();

        let frame = read_extxyz(&path).unwrap();
        assert_eq!(frame.config, config);
        assert_eq!(frame.energy, Some(-1.0 / 7.0));
        assert_eq!(frame.config.pbc, [true, true, false]);
    }

    #[test]
    fn test_plain_xyz_without_lattice_is_non_periodic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.xyz");
        fs::write(&path, "1\nwater fragment\nH 1 2 3\n").unwrap();
        let frame = read_extxyz(&path).unwrap();
        assert!(!frame.config.is_periodic());
        assert_eq!(frame.energy, None);
    }

    #[test]
    fn test_truncated_tail_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("traj.xyz");
        let config = sample();
        append_frames(&path, &[(&config, None), (&config, Some(1.0))]).unwrap();

        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str(&format_extxyz(&config, None));
        let cut = content.len() - 12;
        fs::write(&path, &content[..cut]).unwrap();

        let read = read_extxyz_frames(&path).unwrap();
        assert_eq!(read.frames.len(), 2);
        assert!(read.partial_tail);
    }

    #[test]
    fn test_cut_inside_last_coordinate_drops_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("traj.xyz");
        let config = sample();
        append_frames(&path, &[(&config, None), (&config, Some(1.0))]).unwrap();

        // the newline and three digits of the last z are lost; the line still has 4 fields
        let content = fs::read_to_string(&path).unwrap();
        let mut last = config.clone();
        last.set_atom_position(2, nalgebra::Vector3::new(-4.5, 5.25, 1.0 / 3.0));
        let full = format!("{}{}", content, format_extxyz(&last, None));
        fs::write(&path, &full[..full.len() - 4]).unwrap();

        let read = read_extxyz_frames(&path).unwrap();
        assert_eq!(read.frames.len(), 2);
        assert!(read.partial_tail);
    }

    #[test]
    fn test_single_structure_without_final_newline_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.xyz");
        fs::write(&path, "1\n\nH 1 2 3").unwrap();
        let frame = read_extxyz(&path).unwrap();
        assert_eq!(frame.config.atom_position(0).z, 3.0);
    }

    #[test]
    fn test_bad_coordinate_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.xyz");
        fs::write(&path, "2\n\nH 0 0 0\nH 0 zero 0\nsomething\n").unwrap();
        match read_extxyz_frames(&path) {
            Err(StructureError::Parse { line, .. }) => assert_eq!(line, 4),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
