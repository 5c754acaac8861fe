//! Expedited and segmented transfers
use sdolink_common::{
    sdo::{SdoRequest, SdoResponse},
    CanReceiver, CanSender,
};

use super::{
    session::{Result, TransferSession},
    TransferMode,
};

/// Number of data bytes in a segment
const SEGMENT_SIZE: usize = 7;

impl<S: CanSender, R: CanReceiver> TransferSession<'_, S, R> {
    /// Write 1 to 4 bytes in a single round trip
    pub(super) fn download_expedited(&mut self, data: &[u8]) -> Result<()> {
        let resp = self.round_trip(SdoRequest::expedited_download(self.index, self.sub, data))?;
        match resp {
            // The index/sub of the acknowledgement are not checked, as some devices leave them
            // zeroed
            SdoResponse::ConfirmDownload { .. } => {
                self.bytes_transferred = data.len();
                Ok(())
            }
            _ => self.unexpected(resp),
        }
    }

    pub(super) fn download_segmented(&mut self, data: &[u8]) -> Result<()> {
        self.expected_size = Some(data.len());
        let resp = self.round_trip(SdoRequest::initiate_download(
            self.index,
            self.sub,
            Some(data.len() as u32),
        ))?;
        if !matches!(resp, SdoResponse::ConfirmDownload { .. }) {
            return self.unexpected(resp);
        }

        // An empty object is still written with one (empty) segment
        let total_segments = data.len().div_ceil(SEGMENT_SIZE).max(1);
        for n in 0..total_segments {
            let start = n * SEGMENT_SIZE;
            let end = (start + SEGMENT_SIZE).min(data.len());
            let last_segment = n == total_segments - 1;
            let req = SdoRequest::download_segment(self.toggle, last_segment, &data[start..end]);
            let resp = self.round_trip(req)?;
            match resp {
                SdoResponse::ConfirmDownloadSegment { t } => self.check_toggle(t)?,
                _ => return self.unexpected(resp),
            }
            self.bytes_transferred = end;
        }
        self.check_size()
    }

    /// Read an object with the initiate upload protocol. The server chooses between expedited
    /// and segmented transfer.
    pub(super) fn upload(&mut self) -> Result<Vec<u8>> {
        let resp = self.round_trip(SdoRequest::initiate_upload(self.index, self.sub))?;
        self.continue_upload(resp)
    }

    /// Handle an initiate upload response
    pub(super) fn continue_upload(&mut self, resp: SdoResponse) -> Result<Vec<u8>> {
        match resp {
            SdoResponse::ConfirmUpload {
                n,
                e: true,
                s,
                data,
                ..
            } => {
                self.mode = TransferMode::Expedited;
                let len = if s { 4 - n as usize } else { 4 };
                self.buffer.extend_from_slice(&data[0..len]);
                self.bytes_transferred = len;
                Ok(self.take_buffer())
            }
            SdoResponse::ConfirmUpload {
                e: false, s, data, ..
            } => {
                self.mode = TransferMode::Segmented;
                if s {
                    self.expected_size = Some(u32::from_le_bytes(data) as usize);
                }
                self.upload_segments()
            }
            _ => self.unexpected(resp),
        }
    }

    fn upload_segments(&mut self) -> Result<Vec<u8>> {
        loop {
            let resp = self.round_trip(SdoRequest::upload_segment_request(self.toggle))?;
            match resp {
                SdoResponse::UploadSegment { t, n, c, data } => {
                    self.check_toggle(t)?;
                    let len = SEGMENT_SIZE - n as usize;
                    self.buffer.extend_from_slice(&data[0..len]);
                    self.bytes_transferred += len;
                    if c {
                        break;
                    }
                }
                _ => return self.unexpected(resp),
            }
        }
        self.check_size()?;
        Ok(self.take_buffer())
    }
}
