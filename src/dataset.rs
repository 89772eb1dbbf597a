//! Container file holding named 2-D `f64` datasets, readable one row range at a time.
//!
//! Layout: a fixed 16-byte preamble (magic + header length), a bincode-encoded header
//! listing every dataset, then each dataset's values in row-major little-endian order.
//! A reader only touches the bytes of the rows it asks for.

use crate::slab::RowSlabSource;
use crate::ThreadSafeStdError;
use bytemuck::{Pod, Zeroable};
use log::debug;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: [u8; 8] = *b"DPCAMAT1";
const PREAMBLE_LEN: u64 = std::mem::size_of::<Preamble>() as u64;
const VALUE_LEN: u64 = std::mem::size_of::<f64>() as u64;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Preamble {
    magic: [u8; 8],
    /// Little-endian byte length of the encoded header.
    header_len: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    /// Byte offset of the first value, relative to the end of the header.
    pub data_offset: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ContainerHeader {
    datasets: Vec<DatasetEntry>,
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Writes `datasets` into a new container at `path`, replacing any existing file.
pub fn write_container<P: AsRef<Path>>(path: P, datasets: &[(&str, ArrayView2<'_, f64>)]) -> io::Result<()> {
    let mut header = ContainerHeader::default();
    let mut data_offset = 0u64;
    for (name, data) in datasets {
        if header.datasets.iter().any(|entry| entry.name == *name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dataset name {:?} appears more than once", name),
            ));
        }
        let (rows, cols) = data.dim();
        header.datasets.push(DatasetEntry { name: name.to_string(), rows, cols, data_offset });
        data_offset += (rows * cols) as u64 * VALUE_LEN;
    }

    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| invalid_data(format!("Failed to encode container header: {}", e)))?;
    let preamble = Preamble { magic: MAGIC, header_len: (header_bytes.len() as u64).to_le() };

    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    writer.write_all(bytemuck::bytes_of(&preamble))?;
    writer.write_all(&header_bytes)?;
    for (_, data) in datasets {
        for value in data.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    writer.flush()
}

/// One named dataset inside a container file.
#[derive(Clone, Debug)]
pub struct DatasetFile {
    path: PathBuf,
    entry: DatasetEntry,
    /// Absolute byte offset of the dataset's first value.
    data_start: u64,
}

impl DatasetFile {
    /// Opens `path` and locates the dataset called `name`.
    pub fn open<P: AsRef<Path>>(path: P, name: &str) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut preamble_bytes = [0u8; PREAMBLE_LEN as usize];
        reader
            .read_exact(&mut preamble_bytes)
            .map_err(|e| invalid_data(format!("{:?} is too short to be a dataset container: {}", path, e)))?;
        let preamble: Preamble = bytemuck::pod_read_unaligned(&preamble_bytes);
        if preamble.magic != MAGIC {
            return Err(invalid_data(format!("{:?} is not a dataset container (bad magic)", path)));
        }
        let header_len = u64::from_le(preamble.header_len);
        if PREAMBLE_LEN + header_len > file_len {
            return Err(invalid_data(format!(
                "{:?} declares a {}-byte header but holds only {} bytes",
                path, header_len, file_len
            )));
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes)?;
        let (header, _): (ContainerHeader, usize) =
            bincode::serde::decode_from_slice(&header_bytes, bincode::config::standard())
                .map_err(|e| invalid_data(format!("Failed to decode container header of {:?}: {}", path, e)))?;

        let available: Vec<String> = header.datasets.iter().map(|entry| entry.name.clone()).collect();
        let entry = header
            .datasets
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("dataset {:?} not found in {:?}; available: {:?}", name, path, available),
                )
            })?;

        let data_start = PREAMBLE_LEN + header_len + entry.data_offset;
        let data_len = (entry.rows * entry.cols) as u64 * VALUE_LEN;
        if data_start + data_len > file_len {
            return Err(invalid_data(format!(
                "dataset {:?} in {:?} is truncated: needs {} bytes from offset {}, file holds {}",
                name, path, data_len, data_start, file_len
            )));
        }
        debug!("Opened dataset {:?} in {:?}: {} x {}", name, path, entry.rows, entry.cols);

        Ok(Self { path: path.to_path_buf(), entry, data_start })
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn value_offset(&self, row: usize, col: usize) -> u64 {
        self.data_start + (row * self.entry.cols + col) as u64 * VALUE_LEN
    }
}

fn read_f64s<R: Read>(reader: &mut R, out: &mut [f64]) -> io::Result<()> {
    reader.read_exact(bytemuck::cast_slice_mut(out))?;
    for value in out.iter_mut() {
        *value = f64::from_bits(u64::from_le(value.to_bits()));
    }
    Ok(())
}

impl RowSlabSource for DatasetFile {
    fn shape(&self) -> (usize, usize) {
        (self.entry.rows, self.entry.cols)
    }

    fn read_block(
        &self,
        startingrow: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        if startingrow + rows > self.entry.rows || cols > self.entry.cols {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "hyperslab rows {}..{} x cols 0..{} outside dataset {:?} of shape {}x{}",
                    startingrow,
                    startingrow + rows,
                    cols,
                    self.entry.name,
                    self.entry.rows,
                    self.entry.cols
                ),
            )));
        }
        if rows == 0 || cols == 0 {
            return Ok(Array2::zeros((rows, cols)));
        }

        let mut file = File::open(&self.path)?;
        let mut values = vec![0.0f64; rows * cols];
        if cols == self.entry.cols {
            file.seek(SeekFrom::Start(self.value_offset(startingrow, 0)))?;
            read_f64s(&mut file, &mut values)?;
        } else {
            for (i, row) in values.chunks_mut(cols).enumerate() {
                file.seek(SeekFrom::Start(self.value_offset(startingrow + i, 0)))?;
                read_f64s(&mut file, row)?;
            }
        }
        Ok(Array2::from_shape_vec((rows, cols), values)?)
    }
}
