//! GeoTIFF profiling.
//!
//! Reads the first image of a TIFF file and produces a [`RasterReport`]:
//! dimensions, GeoTIFF georeferencing, CRS code and exact per-band statistics.
//! Pixels are decoded one strip or tile at a time, so memory stays bounded by
//! the chunk size rather than the image size. Decoding is CPU bound; async
//! callers should run it on the blocking pool.

use crate::models::report::{
    BandInfo, BandStatistics, DriverInfo, GeoTransform, Point, RasterReport, RasterSize,
};
use std::{
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
};
use thiserror::Error;
use tiff::{
    TiffError,
    decoder::{Decoder, DecodingResult},
    tags::Tag,
};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_NODATA: u16 = 42113;

const GT_CITATION_KEY: u16 = 1026;
const GT_RASTER_TYPE_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;
const RASTER_PIXEL_IS_POINT: u16 = 2;
const PLANAR_SEPARATE: u16 = 2;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("failed to open raster `{file}`: {reason}")]
    Open { file: String, reason: String },
    #[error("failed to decode raster `{file}`: {reason}")]
    Decode { file: String, reason: String },
}

pub type RasterResult<T> = Result<T, RasterError>;

/// Profile a GeoTIFF on disk. `label` is reported as `raster_file`.
pub fn read_raster_report(path: &Path, label: &str) -> RasterResult<RasterReport> {
    let file = File::open(path).map_err(|err| RasterError::Open {
        file: label.to_string(),
        reason: err.to_string(),
    })?;
    read_raster(BufReader::new(file), label)
}

/// Profile a GeoTIFF from any seekable reader.
pub fn read_raster<R: Read + Seek>(reader: R, label: &str) -> RasterResult<RasterReport> {
    let decode_err = |err: TiffError| RasterError::Decode {
        file: label.to_string(),
        reason: err.to_string(),
    };

    let mut decoder = Decoder::new(reader).map_err(|err| RasterError::Open {
        file: label.to_string(),
        reason: err.to_string(),
    })?;

    let (width, height) = decoder.dimensions().map_err(decode_err)?;
    let samples_per_pixel = find_u16(&mut decoder, Tag::SamplesPerPixel)
        .map_err(decode_err)?
        .unwrap_or(1)
        .max(1);
    let planar = find_u16(&mut decoder, Tag::PlanarConfiguration)
        .map_err(decode_err)?
        .unwrap_or(1);

    let georef = read_georeferencing(&mut decoder).map_err(decode_err)?;
    let nodata = find_ascii(&mut decoder, Tag::from_u16_exhaustive(GDAL_NODATA))
        .map_err(decode_err)?
        .and_then(|text| parse_nodata(&text));

    let band_count = usize::from(samples_per_pixel);
    let profile = profile_bands(
        &mut decoder,
        (width, height),
        band_count,
        planar == PLANAR_SEPARATE,
        nodata,
    )
    .map_err(|reason| RasterError::Decode {
        file: label.to_string(),
        reason,
    })?;

    let bands = profile
        .statistics
        .into_iter()
        .enumerate()
        .map(|(band, statistics)| BandInfo {
            band_number: band as u32 + 1,
            data_type: profile.data_type.to_string(),
            statistics,
        })
        .collect();

    Ok(RasterReport {
        raster_file: label.to_string(),
        driver: DriverInfo {
            short_name: "GTiff".into(),
            long_name: "GeoTIFF".into(),
        },
        size: RasterSize {
            x_size: width,
            y_size: height,
            band_count: band_count as u32,
        },
        projection: georef.projection,
        geotransform: georef.transform,
        bands,
    })
}

#[derive(Debug, Default)]
struct Georeferencing {
    projection: String,
    transform: Option<GeoTransform>,
}

fn read_georeferencing<R: Read + Seek>(
    decoder: &mut Decoder<R>,
) -> Result<Georeferencing, TiffError> {
    let geokeys = match find_u16_vec(decoder, Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))? {
        Some(directory) => {
            let ascii = find_ascii(decoder, Tag::from_u16_exhaustive(GEO_ASCII_PARAMS))?;
            GeoKeys::parse(&directory, ascii.as_deref())
        }
        None => GeoKeys::default(),
    };

    let transform = find_f64_vec(decoder, Tag::from_u16_exhaustive(MODEL_TRANSFORMATION))?;
    let tiepoint = find_f64_vec(decoder, Tag::from_u16_exhaustive(MODEL_TIEPOINT))?;
    let scale = find_f64_vec(decoder, Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))?;

    Ok(Georeferencing {
        projection: geokeys.projection(),
        transform: compute_geotransform(
            transform.as_deref(),
            tiepoint.as_deref(),
            scale.as_deref(),
            geokeys.pixel_is_point(),
        ),
    })
}

/// Derive origin and pixel size the way GDAL's GTiff driver does.
///
/// A full affine `ModelTransformation` takes precedence over tiepoint + scale.
/// PixelIsPoint rasters are shifted by half a pixel to the corner convention.
pub fn compute_geotransform(
    transformation: Option<&[f64]>,
    tiepoint: Option<&[f64]>,
    scale: Option<&[f64]>,
    pixel_is_point: bool,
) -> Option<GeoTransform> {
    let (mut origin, pixel_size) = match (transformation, tiepoint, scale) {
        (Some(m), _, _) if m.len() >= 16 => (Point { x: m[3], y: m[7] }, Point { x: m[0], y: m[5] }),
        (_, Some(tp), Some(sc)) if tp.len() >= 6 && sc.len() >= 2 => {
            let (i, j, x, y) = (tp[0], tp[1], tp[3], tp[4]);
            let (sx, sy) = (sc[0], sc[1]);
            (
                Point {
                    x: x - i * sx,
                    y: y + j * sy,
                },
                Point { x: sx, y: -sy },
            )
        }
        _ => return None,
    };

    if pixel_is_point {
        origin.x -= pixel_size.x / 2.0;
        origin.y -= pixel_size.y / 2.0;
    }

    Some(GeoTransform { origin, pixel_size })
}

/// The subset of the GeoKey directory needed for the report.
#[derive(Debug, Default, PartialEq)]
pub struct GeoKeys {
    pub projected_cs: Option<u16>,
    pub geographic_cs: Option<u16>,
    pub raster_type: Option<u16>,
    pub citation: Option<String>,
}

impl GeoKeys {
    /// Parse a `GeoKeyDirectoryTag` value.
    ///
    /// Layout: a 4-short header whose last entry is the key count, then one
    /// `(key id, tag location, count, value/offset)` quadruple per key.
    pub fn parse(directory: &[u16], ascii_params: Option<&str>) -> Self {
        let mut keys = GeoKeys::default();
        if directory.len() < 4 {
            return keys;
        }

        let count = usize::from(directory[3]);
        for entry in directory[4..].chunks_exact(4).take(count) {
            let (key_id, location, value_count, value) = (entry[0], entry[1], entry[2], entry[3]);
            match (key_id, location) {
                (PROJECTED_CS_TYPE_KEY, 0) => keys.projected_cs = Some(value),
                (GEOGRAPHIC_TYPE_KEY, 0) => keys.geographic_cs = Some(value),
                (GT_RASTER_TYPE_KEY, 0) => keys.raster_type = Some(value),
                (GT_CITATION_KEY, GEO_ASCII_PARAMS) => {
                    keys.citation = ascii_params.and_then(|params| {
                        ascii_slice(params, usize::from(value), usize::from(value_count))
                    });
                }
                _ => {}
            }
        }
        keys
    }

    pub fn projection(&self) -> String {
        let code = self
            .projected_cs
            .filter(|code| *code != USER_DEFINED)
            .or(self.geographic_cs.filter(|code| *code != USER_DEFINED));
        match code {
            Some(code) => format!("EPSG:{}", code),
            None => self.citation.clone().unwrap_or_default(),
        }
    }

    pub fn pixel_is_point(&self) -> bool {
        self.raster_type == Some(RASTER_PIXEL_IS_POINT)
    }
}

fn ascii_slice(params: &str, offset: usize, count: usize) -> Option<String> {
    let text = params.get(offset..(offset + count).min(params.len()))?;
    let text = text.trim_end_matches(['|', '\0']).trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn parse_nodata(text: &str) -> Option<f64> {
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match text.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        other => other.parse::<f64>().ok(),
    }
}

fn find_u16<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<u16>, TiffError> {
    decoder.find_tag(tag)?.map(|value| value.into_u16()).transpose()
}

fn find_u16_vec<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Result<Option<Vec<u16>>, TiffError> {
    decoder
        .find_tag(tag)?
        .map(|value| value.into_u16_vec())
        .transpose()
}

fn find_f64_vec<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Result<Option<Vec<f64>>, TiffError> {
    decoder
        .find_tag(tag)?
        .map(|value| value.into_f64_vec())
        .transpose()
}

fn find_ascii<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Result<Option<String>, TiffError> {
    decoder
        .find_tag(tag)?
        .map(|value| value.into_string())
        .transpose()
}

trait Sample: Copy {
    fn to_f64(self) -> f64;
}

macro_rules! impl_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

impl_sample!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

macro_rules! with_samples {
    ($image:expr, $data:ident => $body:expr) => {
        match $image {
            DecodingResult::U8($data) => $body,
            DecodingResult::U16($data) => $body,
            DecodingResult::U32($data) => $body,
            DecodingResult::U64($data) => $body,
            DecodingResult::I8($data) => $body,
            DecodingResult::I16($data) => $body,
            DecodingResult::I32($data) => $body,
            DecodingResult::I64($data) => $body,
            DecodingResult::F32($data) => $body,
            DecodingResult::F64($data) => $body,
        }
    };
}

fn sample_count(image: &DecodingResult) -> usize {
    with_samples!(image, data => data.len())
}

fn gdal_type_name(image: &DecodingResult) -> &'static str {
    match image {
        DecodingResult::U8(_) => "Byte",
        DecodingResult::U16(_) => "UInt16",
        DecodingResult::U32(_) => "UInt32",
        DecodingResult::U64(_) => "UInt64",
        DecodingResult::I8(_) => "Int8",
        DecodingResult::I16(_) => "Int16",
        DecodingResult::I32(_) => "Int32",
        DecodingResult::I64(_) => "Int64",
        DecodingResult::F32(_) => "Float32",
        DecodingResult::F64(_) => "Float64",
    }
}

struct BandProfile {
    data_type: &'static str,
    statistics: Vec<Option<BandStatistics>>,
}

/// Walk every strip or tile of the current image and accumulate per-band
/// statistics.
///
/// Chunky images carry all bands in each chunk. Band-sequential images store
/// one plane per band, and chunk `plane * chunks_per_plane + i` belongs to
/// band `plane`.
fn profile_bands<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    (width, height): (u32, u32),
    band_count: usize,
    separate_planes: bool,
    nodata: Option<f64>,
) -> Result<BandProfile, String> {
    let (chunk_width, chunk_height) = decoder.chunk_dimensions();
    if chunk_width == 0 || chunk_height == 0 {
        return Err("image has zero-sized strips or tiles".into());
    }
    let (width, height) = (u64::from(width), u64::from(height));
    let (chunk_width, chunk_height) = (u64::from(chunk_width), u64::from(chunk_height));
    let across = width.div_ceil(chunk_width);
    let chunks_per_plane = across * height.div_ceil(chunk_height);
    let planes = if separate_planes { band_count } else { 1 };

    let mut bands = vec![Welford::default(); band_count];
    let mut data_type = None;
    for plane in 0..planes {
        let targets = if separate_planes {
            &mut bands[plane..=plane]
        } else {
            &mut bands[..]
        };
        for index in 0..chunks_per_plane {
            let chunk_index = u32::try_from(plane as u64 * chunks_per_plane + index)
                .map_err(|_| "image has too many strips or tiles".to_string())?;
            let chunk = decoder
                .read_chunk(chunk_index)
                .map_err(|err| err.to_string())?;
            data_type.get_or_insert(gdal_type_name(&chunk));

            let (row, col) = (index / across, index % across);
            let layout = ChunkLayout {
                data_width: chunk_width.min(width - col * chunk_width) as usize,
                data_height: chunk_height.min(height - row * chunk_height) as usize,
                chunk_width: chunk_width as usize,
            };
            accumulate_chunk(&chunk, layout, targets, nodata)
                .map_err(|reason| format!("chunk {}: {}", chunk_index, reason))?;
        }
    }

    let data_type = data_type.ok_or_else(|| "image has no strips or tiles".to_string())?;
    Ok(BandProfile {
        data_type,
        statistics: bands.iter().map(Welford::finish).collect(),
    })
}

/// Pixel extent of one decoded chunk.
///
/// Edge tiles may come back padded to the full tile width; only the first
/// `data_width` pixels of each row and `data_height` rows hold image data.
#[derive(Debug, Clone, Copy)]
struct ChunkLayout {
    data_width: usize,
    data_height: usize,
    chunk_width: usize,
}

/// Feed the samples of one chunk into `bands`, interleaved sample `i` of a
/// pixel going to `bands[i]`.
fn accumulate_chunk(
    chunk: &DecodingResult,
    layout: ChunkLayout,
    bands: &mut [Welford],
    nodata: Option<f64>,
) -> Result<(), String> {
    let samples = bands.len();
    let row_len = layout.data_width * samples;
    if row_len == 0 || layout.data_height == 0 {
        return Ok(());
    }

    let len = sample_count(chunk);
    let stride = if len == row_len * layout.data_height {
        row_len
    } else if len >= layout.chunk_width * samples * layout.data_height {
        layout.chunk_width * samples
    } else {
        return Err(format!(
            "expected {} samples, decoder returned {}",
            row_len * layout.data_height,
            len
        ));
    };

    with_samples!(chunk, data => {
        for row in data.chunks(stride).take(layout.data_height) {
            for (i, sample) in row[..row_len].iter().enumerate() {
                bands[i % samples].push(sample.to_f64(), nodata);
            }
        }
    });
    Ok(())
}

/// Running min/max/mean/variance (Welford) over valid samples.
#[derive(Debug, Clone, Copy)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for Welford {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Welford {
    fn push(&mut self, value: f64, nodata: Option<f64>) {
        if value.is_nan() || nodata.is_some_and(|nd| nd == value) {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn finish(&self) -> Option<BandStatistics> {
        (self.count > 0).then(|| BandStatistics {
            min: self.min,
            max: self.max,
            mean: self.mean,
            std_dev: (self.m2 / self.count as f64).sqrt(),
        })
    }
}

/// Exact min/max/mean/population standard deviation over valid samples.
///
/// NaN samples and samples equal to `nodata` are skipped. Returns `None` when
/// no valid sample remains.
pub fn compute_statistics(
    samples: impl Iterator<Item = f64>,
    nodata: Option<f64>,
) -> Option<BandStatistics> {
    let mut acc = Welford::default();
    for value in samples {
        acc.push(value, nodata);
    }
    acc.finish()
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory GeoTIFF fixtures written with the `tiff` encoder.

    use std::io::Cursor;
    use tiff::{
        encoder::{TiffEncoder, colortype},
        tags::Tag,
    };

    pub struct GeoTiffFixture {
        pub tiepoint: Option<Vec<f64>>,
        pub scale: Option<Vec<f64>>,
        pub geokeys: Option<Vec<u16>>,
        pub ascii_params: Option<String>,
        pub nodata: Option<String>,
        /// Strip height; the encoder picks one when `None`.
        pub rows_per_strip: Option<u32>,
    }

    impl Default for GeoTiffFixture {
        fn default() -> Self {
            Self {
                tiepoint: Some(vec![0.0, 0.0, 0.0, 10.0, 50.0, 0.0]),
                scale: Some(vec![0.5, 0.25, 0.0]),
                // version 1.1.0, 2 keys: ModelTypeGeographic, GeographicType 4326.
                geokeys: Some(vec![1, 1, 0, 2, 1024, 0, 1, 2, 2048, 0, 1, 4326]),
                ascii_params: None,
                nodata: None,
                rows_per_strip: None,
            }
        }
    }

    impl GeoTiffFixture {
        /// Single-band Float32 image.
        pub fn gray_f32(&self, width: u32, height: u32, data: &[f32]) -> Vec<u8> {
            let mut buffer = Cursor::new(Vec::new());
            let mut tiff = TiffEncoder::new(&mut buffer).unwrap();
            let mut image = tiff
                .new_image::<colortype::Gray32Float>(width, height)
                .unwrap();
            if let Some(rows) = self.rows_per_strip {
                image.rows_per_strip(rows).unwrap();
            }
            self.write_geo_tags(image.encoder());
            image.write_data(data).unwrap();
            buffer.into_inner()
        }

        /// Three-band Byte image, chunky (pixel-interleaved).
        pub fn rgb_u8(&self, width: u32, height: u32, data: &[u8]) -> Vec<u8> {
            let mut buffer = Cursor::new(Vec::new());
            let mut tiff = TiffEncoder::new(&mut buffer).unwrap();
            let mut image = tiff.new_image::<colortype::RGB8>(width, height).unwrap();
            if let Some(rows) = self.rows_per_strip {
                image.rows_per_strip(rows).unwrap();
            }
            self.write_geo_tags(image.encoder());
            image.write_data(data).unwrap();
            buffer.into_inner()
        }

        fn write_geo_tags<W: std::io::Write + std::io::Seek, K: tiff::encoder::TiffKind>(
            &self,
            encoder: &mut tiff::encoder::DirectoryEncoder<'_, W, K>,
        ) {
            if let Some(tiepoint) = &self.tiepoint {
                encoder
                    .write_tag(Tag::from_u16_exhaustive(super::MODEL_TIEPOINT), &tiepoint[..])
                    .unwrap();
            }
            if let Some(scale) = &self.scale {
                encoder
                    .write_tag(Tag::from_u16_exhaustive(super::MODEL_PIXEL_SCALE), &scale[..])
                    .unwrap();
            }
            if let Some(geokeys) = &self.geokeys {
                encoder
                    .write_tag(Tag::from_u16_exhaustive(super::GEO_KEY_DIRECTORY), &geokeys[..])
                    .unwrap();
            }
            if let Some(ascii) = &self.ascii_params {
                encoder
                    .write_tag(Tag::from_u16_exhaustive(super::GEO_ASCII_PARAMS), ascii.as_str())
                    .unwrap();
            }
            if let Some(nodata) = &self.nodata {
                encoder
                    .write_tag(Tag::from_u16_exhaustive(super::GDAL_NODATA), nodata.as_str())
                    .unwrap();
            }
        }
    }
}
