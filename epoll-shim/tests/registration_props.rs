//! Property tests for registration bookkeeping

use std::collections::BTreeSet;
use std::os::fd::RawFd;

use proptest::prelude::*;

use epoll_shim::*;

const PIPES: usize = 3;

#[derive(Debug, Clone, Copy)]
enum Op {
    Add(usize, bool),
    Modify(usize, bool),
    Delete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PIPES, any::<bool>()).prop_map(|(i, et)| Op::Add(i, et)),
        (0..PIPES, any::<bool>()).prop_map(|(i, et)| Op::Modify(i, et)),
        (0..PIPES).prop_map(Op::Delete),
    ]
}

fn interest(edge: bool) -> EpollEvent {
    let mut flags = EpollFlags::EPOLLIN;
    if edge {
        flags |= EpollFlags::EPOLLET;
    }
    EpollEvent::new(flags, 0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_registrations_follow_set_model(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let epfd = epoll_create1(0).unwrap();
        let pipes: Vec<(RawFd, RawFd)> = (0..PIPES)
            .map(|_| {
                let mut fds = [0; 2];
                assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
                (fds[0], fds[1])
            })
            .collect();
        let mut model = BTreeSet::new();

        for op in ops {
            match op {
                Op::Add(i, edge) => {
                    let fd = pipes[i].0;
                    let res = epoll_ctl(epfd, EPOLL_CTL_ADD, fd, Some(&interest(edge)));
                    if model.insert(fd) {
                        prop_assert_eq!(res, Ok(()));
                    } else {
                        prop_assert_eq!(res, Err(SyscallError::AlreadyExists));
                    }
                }
                Op::Modify(i, edge) => {
                    let fd = pipes[i].0;
                    let res = epoll_ctl(epfd, EPOLL_CTL_MOD, fd, Some(&interest(edge)));
                    if model.contains(&fd) {
                        prop_assert_eq!(res, Ok(()));
                    } else {
                        prop_assert_eq!(res, Err(SyscallError::NotFound));
                    }
                }
                Op::Delete(i) => {
                    let fd = pipes[i].0;
                    let res = epoll_ctl(epfd, EPOLL_CTL_DEL, fd, None);
                    if model.remove(&fd) {
                        prop_assert_eq!(res, Ok(()));
                    } else {
                        prop_assert_eq!(res, Err(SyscallError::NotFound));
                    }
                }
            }
            let watched: BTreeSet<RawFd> = epoll::watched_fds(epfd).unwrap().into_iter().collect();
            prop_assert_eq!(&watched, &model);
        }

        // Nothing is readable, so nothing may be reported.
        let mut events = [EpollEvent::default(); PIPES];
        prop_assert_eq!(epoll_wait(epfd, &mut events, 0), Ok(0));

        for (reader, writer) in pipes {
            close(reader).unwrap();
            close(writer).unwrap();
        }
        close(epfd).unwrap();
    }
}
