use std::{
    io,
    thread::{self, JoinHandle},
};

use afio_io::{FileHandle, PosixFile};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error};

use crate::{async_file::AsyncFile, request::Request};

/// A request travelling together with the executor that runs it.
///
/// The executor moves with the job, so whoever holds the `Job` owns the file. Once the request
/// has run, the whole `Job` comes back on the completion channel.
#[derive(Debug)]
pub struct Job<H: FileHandle = PosixFile> {
    pub file: AsyncFile<H>,
    pub request: Request,
}

impl<H: FileHandle> Job<H> {
    pub fn new(file: AsyncFile<H>, request: Request) -> Self {
        Self { file, request }
    }
}

/// A named worker thread that executes [`Job`]s in the order they are pushed.
///
/// Dropping the `IoThread` lets it finish the jobs already queued, then joins it.
pub struct IoThread<H: FileHandle = PosixFile> {
    /// Only `None` while being dropped.
    queue: Option<Sender<Job<H>>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl<H> IoThread<H>
where
    H: FileHandle + Send + 'static,
{
    /// Starts the thread. Finished jobs are sent to `completions`.
    pub fn spawn(name: impl Into<String>, completions: Sender<Job<H>>) -> io::Result<Self> {
        let name = name.into();
        let (queue, jobs) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(jobs, completions))?;
        Ok(Self {
            queue: Some(queue),
            handle: Some(handle),
            name,
        })
    }

    /// Queues `job`. Hands it back if the thread has gone away.
    pub fn push(&self, job: Job<H>) -> Result<(), Job<H>> {
        match &self.queue {
            Some(queue) => queue.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn run<H: FileHandle>(jobs: Receiver<Job<H>>, completions: Sender<Job<H>>) {
    let me = thread::current().id();
    for mut job in jobs.iter() {
        job.file.attach(me);
        job.file.execute(&mut job.request);
        job.file.detach(me);
        if completions.send(job).is_err() {
            debug!("completion channel closed; stopping");
            return;
        }
    }
}

impl<H: FileHandle> Drop for IoThread<H> {
    fn drop(&mut self) {
        // Closing the queue ends the thread's loop once it has drained.
        drop(self.queue.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(thread = %self.name, "I/O thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AsyncFileConfig, open_flags::OpenFlags, request::OpenParams};

    #[test]
    fn test_jobs_come_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let io_thread = IoThread::spawn("afio-test", tx).unwrap();
        assert_eq!(io_thread.name(), "afio-test");

        let file = AsyncFile::new(AsyncFileConfig::default()).unwrap();
        let params = OpenParams::new(
            dir.path().join("a"),
            OpenFlags::CREATE | OpenFlags::WRITE_ONLY | OpenFlags::READ_SIZE,
        );
        io_thread
            .push(Job::new(file, Request::open(params, 1)))
            .unwrap();

        let job = rx.recv().unwrap();
        assert_eq!(job.request.result(), Ok(()));
        assert_eq!(job.request.file_size, Some(0));
        assert!(job.file.is_open());
        assert_eq!(job.file.attached_thread(), None);

        io_thread
            .push(Job::new(job.file, Request::close(2)))
            .unwrap();
        let job = rx.recv().unwrap();
        assert_eq!(job.request.user_data, 2);
        assert!(job.request.error.is_none());
        assert!(!job.file.is_open());
    }

    #[test]
    fn test_drop_joins_after_draining() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let io_thread = IoThread::spawn("afio-drain", tx).unwrap();
        for user_data in 0..3 {
            let file = AsyncFile::new(AsyncFileConfig::default()).unwrap();
            let params = OpenParams::new("/nonexistent/afio/file", OpenFlags::READ_ONLY);
            io_thread
                .push(Job::new(file, Request::open(params, user_data)))
                .unwrap();
        }
        drop(io_thread);
        let finished: Vec<_> = rx.try_iter().map(|job| job.request.user_data).collect();
        assert_eq!(finished, vec![0, 1, 2]);
    }
}
