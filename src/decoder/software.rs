// Software decoder using Cisco OpenH264
// H.264 only, frames land in host memory as planar YUV 4:2:0

use super::{
    DecoderContext, DecoderError, HostImage, Packet, Plane, RawFrame, RawPixelFormat,
};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct SoftwareDecoder {
    decoder: Option<Mutex<Decoder>>,
    pending: VecDeque<RawFrame>,
    frame_count: u64,
}

impl SoftwareDecoder {
    pub fn new() -> Result<Self, DecoderError> {
        let decoder = Decoder::new().map_err(|e| {
            DecoderError::AcceleratorInit(format!("Failed to create OpenH264 decoder: {}", e))
        })?;

        log::info!("OpenH264 software decoder initialized");

        Ok(Self {
            decoder: Some(Mutex::new(decoder)),
            pending: VecDeque::new(),
            frame_count: 0,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

fn copy_plane(data: &[u8], stride: usize, rows: usize, name: &str) -> Result<Plane, DecoderError> {
    let size = stride * rows;
    let bytes = data.get(..size).ok_or_else(|| {
        DecoderError::Transient(format!(
            "{} plane too short: {} bytes, need {}",
            name,
            data.len(),
            size
        ))
    })?;
    Ok(Plane::new(bytes.to_vec(), stride))
}

impl DecoderContext for SoftwareDecoder {
    fn submit(&mut self, packet: &Packet) -> Result<(), DecoderError> {
        let decoder_guard = self
            .decoder
            .as_ref()
            .ok_or_else(|| DecoderError::Structural("Decoder already closed".to_string()))?;

        let mut decoder = decoder_guard.lock();

        let maybe_yuv = decoder
            .decode(&packet.data)
            .map_err(|e| DecoderError::Transient(format!("Decode failed: {}", e)))?;

        // OpenH264 may not produce a frame for every input (buffering)
        let Some(yuv) = maybe_yuv else {
            return Ok(());
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let chroma_rows = height.div_ceil(2);

        let image = HostImage {
            format: RawPixelFormat::Yuv420p,
            width: width as u32,
            height: height as u32,
            planes: vec![
                copy_plane(yuv.y(), y_stride, height, "Y")?,
                copy_plane(yuv.u(), u_stride, chroma_rows, "U")?,
                copy_plane(yuv.v(), v_stride, chroma_rows, "V")?,
            ],
        };

        self.frame_count += 1;
        self.pending.push_back(RawFrame::host(packet.pts, image));
        Ok(())
    }

    fn drain(&mut self) -> Result<Option<RawFrame>, DecoderError> {
        Ok(self.pending.pop_front())
    }

    fn flush(&mut self) -> Result<(), DecoderError> {
        // OpenH264 outputs frames as soon as they decode, nothing is held back
        Ok(())
    }

    fn close(&mut self) {
        if self.decoder.take().is_some() {
            log::debug!("OpenH264 decoder closed after {} frames", self.frame_count);
        }
        self.pending.clear();
    }

    fn info(&self) -> &str {
        "OpenH264 (Software)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_transient() {
        let mut decoder = SoftwareDecoder::new().unwrap();
        // No start code, no decodable NAL
        let result = decoder.submit(&Packet::new(vec![0xff; 64], 0, false));
        if let Err(e) = result {
            assert!(matches!(e, DecoderError::Transient(_)));
        }
        assert!(decoder.drain().unwrap().is_none());
    }

    #[test]
    fn test_closed_decoder_rejects_packets() {
        let mut decoder = SoftwareDecoder::new().unwrap();
        decoder.close();
        let result = decoder.submit(&Packet::new(vec![0, 0, 0, 1, 0x65], 0, true));
        assert!(matches!(result, Err(DecoderError::Structural(_))));
        assert_eq!(decoder.info(), "OpenH264 (Software)");
    }
}
