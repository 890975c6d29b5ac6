//! Recursive-descent parser over [`crate::lexer`]'s token stream, building an [`Ast`] directly
//! (no intermediate parse tree) per the grammar in the probe DSL's reference.
//!
//! `||`/`&&` have no native VM opcode: both lower to the bitwise ALU ops over operands first
//! normalized to 0/1 by a double [`crate::node::NodeKind::Not`], matching the VM's "no boolean
//! type" stance (see `descriptor::ValueType`).

use crate::ast::Ast;
use crate::error::ParseError;
use crate::lexer::{lex, Spanned, Token};
use crate::node::{AluOp, BinOp, BinOpKind, Call, CmpOp, MapRef, Method, NodeId, NodeKind, Probe};

pub fn parse(src: &str) -> Result<Ast, ParseError> {
    let toks = lex(src)?;
    let mut p = Parser {
        toks,
        pos: 0,
        ast: Ast::new(),
    };
    p.script()?;
    Ok(p.ast)
}

struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
    ast: Ast,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.toks[self.pos].tok
    }

    fn peek_pos(&self) -> usize {
        self.toks[self.pos].pos
    }

    fn advance(&mut self) -> Token {
        let t = self.toks[self.pos].tok.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn describe(tok: &Token) -> String {
        format!("{tok:?}")
    }

    fn expect(&mut self, want: &Token) -> Result<(), ParseError> {
        if self.peek() == want {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::Expected {
                pos: self.peek_pos(),
                expected: Self::describe(want),
                found: Self::describe(self.peek()),
            })
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Token::Ident(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(ParseError::Expected {
                pos: self.peek_pos(),
                expected: "identifier".into(),
                found: Self::describe(&other),
            }),
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    // script := probe*
    fn script(&mut self) -> Result<(), ParseError> {
        let script_id = self.ast.script();
        while !self.at_eof() {
            let probe_id = self.probe(script_id)?;
            self.ast.script_data_mut().probes.push(probe_id);
        }
        Ok(())
    }

    // probe := pspec ('/' expr '/')? '{' stmt* '}'
    fn probe(&mut self, script_id: NodeId) -> Result<NodeId, ParseError> {
        let (provider, target) = self.pspec()?;
        let probe_id = self.ast.push(
            NodeKind::Probe(Probe {
                provider,
                target,
                pred: None,
                stmts: vec![],
                sp: 0,
            }),
            None,
            script_id,
        );

        if *self.peek() == Token::Slash {
            self.advance();
            let pred = self.expr(probe_id)?;
            self.expect(&Token::Slash)?;
            self.ast.probe_data_mut(probe_id).pred = Some(pred);
        }

        self.expect(&Token::LBrace)?;
        let mut stmts = vec![];
        while *self.peek() != Token::RBrace {
            stmts.push(self.stmt(probe_id)?);
        }
        self.expect(&Token::RBrace)?;
        self.ast.probe_data_mut(probe_id).stmts = stmts;
        Ok(probe_id)
    }

    // pspec := IDENT ':' IDENT ('*' | '?')?
    fn pspec(&mut self) -> Result<(String, String), ParseError> {
        let provider = self.expect_ident()?;
        self.expect(&Token::Colon)?;
        let mut target = self.expect_ident()?;
        match self.peek() {
            Token::Star => {
                target.push('*');
                self.advance();
            }
            Token::Question => {
                target.push('?');
                self.advance();
            }
            _ => {}
        }
        Ok((provider, target))
    }

    fn stmt(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        // Bare builtin call statement: IDENT '(' ...
        if let Token::Ident(name) = self.peek().clone() {
            if self.toks.get(self.pos + 1).map(|s| &s.tok) == Some(&Token::LParen) {
                self.advance();
                let call_id = self.call_tail(probe_id, name)?;
                self.expect(&Token::Semi)?;
                return Ok(call_id);
            }
        }

        if *self.peek() == Token::Return {
            self.advance();
            let expr = if *self.peek() == Token::Semi {
                None
            } else {
                Some(self.expr(probe_id)?)
            };
            self.expect(&Token::Semi)?;
            return Ok(self.ast.push(NodeKind::Return(expr), None, probe_id));
        }

        // Everything else starts with a map reference.
        let map_id = self.map(probe_id)?;

        if *self.peek() == Token::Dot {
            self.advance();
            let name = self.expect_ident()?;
            self.expect(&Token::LParen)?;
            let call_id = self.call_tail(probe_id, name)?;
            self.expect(&Token::Semi)?;
            return Ok(self.ast.push(
                NodeKind::Method(Method {
                    map: map_id,
                    call: call_id,
                }),
                None,
                probe_id,
            ));
        }

        if let Token::OpAssign(op) = self.peek().clone() {
            self.advance();
            let op = Self::opassign_op(&op);
            let expr = self.expr(probe_id)?;
            self.expect(&Token::Semi)?;
            return Ok(self.ast.push(
                NodeKind::Assign(crate::node::Assign {
                    lval: map_id,
                    op: Some(op),
                    expr: Some(expr),
                }),
                None,
                probe_id,
            ));
        }

        self.expect(&Token::Assign)?;

        // Delete forms: `@x = [];` or `@x = nil;`.
        if *self.peek() == Token::LBracket {
            self.advance();
            self.expect(&Token::RBracket)?;
            self.expect(&Token::Semi)?;
            return Ok(self.ast.push(
                NodeKind::Assign(crate::node::Assign {
                    lval: map_id,
                    op: None,
                    expr: None,
                }),
                None,
                probe_id,
            ));
        }
        if *self.peek() == Token::Nil {
            self.advance();
            self.expect(&Token::Semi)?;
            return Ok(self.ast.push(
                NodeKind::Assign(crate::node::Assign {
                    lval: map_id,
                    op: None,
                    expr: None,
                }),
                None,
                probe_id,
            ));
        }

        let expr = self.expr(probe_id)?;
        self.expect(&Token::Semi)?;
        Ok(self.ast.push(
            NodeKind::Assign(crate::node::Assign {
                lval: map_id,
                op: Some(AluOp::Mov),
                expr: Some(expr),
            }),
            None,
            probe_id,
        ))
    }

    fn opassign_op(sym: &str) -> AluOp {
        match sym {
            "+" => AluOp::Add,
            "-" => AluOp::Sub,
            "*" => AluOp::Mul,
            "/" => AluOp::Div,
            "%" => AluOp::Mod,
            "&" => AluOp::And,
            "|" => AluOp::Or,
            "^" => AluOp::Xor,
            "<<" => AluOp::Lsh,
            ">>" => AluOp::Rsh,
            _ => unreachable!("lexer only emits known op-assign symbols"),
        }
    }

    // map := '@' IDENT? ('[' arglist ']')?
    fn map(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        self.expect(&Token::At)?;
        let name = if let Token::Ident(s) = self.peek().clone() {
            self.advance();
            Some(s)
        } else {
            None
        };
        let key = if *self.peek() == Token::LBracket {
            self.advance();
            let args = self.arglist(probe_id)?;
            self.expect(&Token::RBracket)?;
            args
        } else {
            vec![]
        };
        Ok(self
            .ast
            .push(NodeKind::Map(MapRef { name, key }), None, probe_id))
    }

    fn arglist(&mut self, probe_id: NodeId) -> Result<Vec<NodeId>, ParseError> {
        let mut args = vec![];
        if *self.peek() == Token::RParen || *self.peek() == Token::RBracket {
            return Ok(args);
        }
        args.push(self.expr(probe_id)?);
        while *self.peek() == Token::Comma {
            self.advance();
            args.push(self.expr(probe_id)?);
        }
        Ok(args)
    }

    /// Parses the argument list of a call whose opening `(` has already been consumed, and
    /// pushes the resulting [`NodeKind::Call`] node. `name` is the callee identifier.
    fn call_tail(&mut self, probe_id: NodeId, name: String) -> Result<NodeId, ParseError> {
        let args = self.arglist(probe_id)?;
        self.expect(&Token::RParen)?;
        Ok(self
            .ast
            .push(NodeKind::Call(Call { func: name, args }), None, probe_id))
    }

    fn expr(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        self.orexpr(probe_id)
    }

    /// `a || b` normalizes each side to 0/1 via double-`not` then bitwise-ORs them.
    fn orexpr(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        let mut left = self.andexpr(probe_id)?;
        while *self.peek() == Token::OrOr {
            self.advance();
            let right = self.andexpr(probe_id)?;
            left = self.logical_binop(probe_id, AluOp::Or, left, right);
        }
        Ok(left)
    }

    fn andexpr(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        let mut left = self.cmpexpr(probe_id)?;
        while *self.peek() == Token::AndAnd {
            self.advance();
            let right = self.cmpexpr(probe_id)?;
            left = self.logical_binop(probe_id, AluOp::And, left, right);
        }
        Ok(left)
    }

    fn logical_binop(&mut self, probe_id: NodeId, op: AluOp, left: NodeId, right: NodeId) -> NodeId {
        let l = self.double_not(probe_id, left);
        let r = self.double_not(probe_id, right);
        self.ast.push(
            NodeKind::BinOp(BinOp {
                kind: BinOpKind::Alu(op),
                left: l,
                right: r,
            }),
            None,
            probe_id,
        )
    }

    fn double_not(&mut self, probe_id: NodeId, e: NodeId) -> NodeId {
        let inner = self.ast.push(NodeKind::Not(e), None, probe_id);
        self.ast.push(NodeKind::Not(inner), None, probe_id)
    }

    fn cmpexpr(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        let left = self.addexpr(probe_id)?;
        let op = match self.peek() {
            Token::EqEq => Some(CmpOp::Eq),
            Token::Ne => Some(CmpOp::Ne),
            Token::Lt => Some(CmpOp::Lt),
            Token::Le => Some(CmpOp::Le),
            Token::Gt => Some(CmpOp::Gt),
            Token::Ge => Some(CmpOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let right = self.addexpr(probe_id)?;
                Ok(self.ast.push(
                    NodeKind::BinOp(BinOp {
                        kind: BinOpKind::Cmp(op),
                        left,
                        right,
                    }),
                    None,
                    probe_id,
                ))
            }
            None => Ok(left),
        }
    }

    fn addexpr(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        let mut left = self.mulexpr(probe_id)?;
        loop {
            let op = match self.peek() {
                Token::Plus => AluOp::Add,
                Token::Minus => AluOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.mulexpr(probe_id)?;
            left = self.ast.push(
                NodeKind::BinOp(BinOp {
                    kind: BinOpKind::Alu(op),
                    left,
                    right,
                }),
                None,
                probe_id,
            );
        }
        Ok(left)
    }

    fn mulexpr(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        let mut left = self.unary(probe_id)?;
        loop {
            let op = match self.peek() {
                Token::Star => AluOp::Mul,
                Token::Slash => AluOp::Div,
                Token::Percent => AluOp::Mod,
                Token::Amp => AluOp::And,
                Token::Pipe => AluOp::Or,
                Token::Caret => AluOp::Xor,
                Token::Shl => AluOp::Lsh,
                Token::Shr => AluOp::Rsh,
                _ => break,
            };
            self.advance();
            let right = self.unary(probe_id)?;
            left = self.ast.push(
                NodeKind::BinOp(BinOp {
                    kind: BinOpKind::Alu(op),
                    left,
                    right,
                }),
                None,
                probe_id,
            );
        }
        Ok(left)
    }

    fn unary(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        if *self.peek() == Token::Bang {
            self.advance();
            let inner = self.unary(probe_id)?;
            return Ok(self.ast.push(NodeKind::Not(inner), None, probe_id));
        }
        self.primary(probe_id)
    }

    // primary := INT | STR | map | IDENT '(' arglist? ')' | '(' expr ')'
    fn primary(&mut self, probe_id: NodeId) -> Result<NodeId, ParseError> {
        match self.peek().clone() {
            Token::Int(v) => {
                self.advance();
                Ok(self.ast.push(NodeKind::Int(v), None, probe_id))
            }
            Token::Str(s) => {
                self.advance();
                Ok(self.ast.push(NodeKind::Str(s), None, probe_id))
            }
            Token::At => self.map(probe_id),
            Token::LParen => {
                self.advance();
                let e = self.expr(probe_id)?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Token::Ident(name) => {
                self.advance();
                if *self.peek() == Token::LParen {
                    self.advance();
                    self.call_tail(probe_id, name)
                } else {
                    // A bare identifier outside a call position is a zero-arg builtin
                    // reference, e.g. `pid` instead of `pid()`.
                    Ok(self
                        .ast
                        .push(NodeKind::Call(Call { func: name, args: vec![] }), None, probe_id))
                }
            }
            other => Err(ParseError::Expected {
                pos: self.peek_pos(),
                expected: "expression".into(),
                found: Self::describe(&other),
            }),
        }
    }
}
