//! SFTP file transfer for [`RusshConnection`]
//!
//! Some sshd configurations do not enable sftp by default. The remote side
//! needs a line like `Subsystem sftp internal-sftp` in its sshd_config.

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::connection::RusshConnection;
use crate::error::{FleetError, Result};

impl RusshConnection {
    /// The connection's SFTP subsystem, opened on first use
    async fn sftp(&mut self) -> Result<&SftpSession> {
        let sftp = match self.sftp.take() {
            Some(sftp) => sftp,
            None => {
                let channel = self.session.channel_open_session().await?;
                channel.request_subsystem(true, "sftp").await?;
                debug!("Opened SFTP subsystem on {}", self.label);
                SftpSession::new(channel.into_stream()).await?
            }
        };
        Ok(self.sftp.insert(sftp))
    }

    pub(crate) async fn upload(
        &mut self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64> {
        let mut remote_file = self
            .sftp()
            .await?
            .open_with_flags(
                remote_path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;

        let written = tokio::io::copy(source, &mut remote_file)
            .await
            .map_err(|e| FleetError::from_transfer_io("upload", e))?;
        remote_file
            .shutdown()
            .await
            .map_err(|e| FleetError::from_transfer_io("finish upload", e))?;

        debug!("Uploaded {} bytes to {}:{}", written, self.label, remote_path);
        Ok(written)
    }

    pub(crate) async fn download(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut remote_file = self
            .sftp()
            .await?
            .open_with_flags(remote_path, OpenFlags::READ)
            .await?;

        let read = tokio::io::copy(&mut remote_file, sink)
            .await
            .map_err(|e| FleetError::from_transfer_io("download", e))?;
        sink.flush()
            .await
            .map_err(|e| FleetError::from_transfer_io("flush download", e))?;

        debug!("Downloaded {} bytes from {}:{}", read, self.label, remote_path);
        Ok(read)
    }
}
